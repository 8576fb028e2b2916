//! Status/progress event emission (spec §9 design note: "re-architect as an
//! injected sink object with two methods or a pair of channels — both
//! suffice because events are advisory").

/// Where the engine reports human-readable phase transitions and numeric
/// progress. Implementations must be non-blocking or internally buffered
/// (spec §5: "Progress and status events are single-producer; consumers must
/// be non-blocking or buffered").
pub trait EventSink {
    fn status(&self, message: &str);
    fn progress(&self, percent: u8);
}

/// A sink that does nothing; useful for tests and for callers that don't
/// want events.
pub struct NullSink;

impl EventSink for NullSink {
    fn status(&self, _message: &str) {}
    fn progress(&self, _percent: u8) {}
}

/// An event, for callers who'd rather receive a channel than implement a
/// trait (the other half of the design note above).
#[derive(Debug, Clone)]
pub enum Event {
    Status(String),
    Progress(u8),
}

/// Adapts a `crossbeam_channel::Sender<Event>` into an [`EventSink`]. Used by
/// the bundled CLI, which wants events on a channel it can `select!` over
/// alongside keyboard input, the way the teacher's own UI loop does.
pub struct ChannelEventSink {
    sender: crossbeam_channel::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(sender: crossbeam_channel::Sender<Event>) -> ChannelEventSink {
        ChannelEventSink { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn status(&self, message: &str) {
        let _ = self.sender.send(Event::Status(message.to_string()));
    }

    fn progress(&self, percent: u8) {
        let _ = self.sender.send(Event::Progress(percent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSink {
        statuses: RefCell<Vec<String>>,
        progresses: RefCell<Vec<u8>>,
    }

    impl EventSink for RecordingSink {
        fn status(&self, message: &str) {
            self.statuses.borrow_mut().push(message.to_string());
        }
        fn progress(&self, percent: u8) {
            self.progresses.borrow_mut().push(percent);
        }
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelEventSink::new(tx);
        sink.status("Connected");
        sink.progress(42);
        assert!(matches!(rx.recv().unwrap(), Event::Status(s) if s == "Connected"));
        assert!(matches!(rx.recv().unwrap(), Event::Progress(42)));
    }

    #[test]
    fn null_sink_accepts_everything() {
        let sink = NullSink;
        sink.status("ignored");
        sink.progress(100);
    }

    #[test]
    fn recording_sink_accumulates() {
        let sink = RecordingSink {
            statuses: RefCell::new(Vec::new()),
            progresses: RefCell::new(Vec::new()),
        };
        sink.status("a");
        sink.status("b");
        sink.progress(50);
        assert_eq!(sink.statuses.borrow().as_slice(), &["a", "b"]);
        assert_eq!(sink.progresses.borrow().as_slice(), &[50]);
    }
}
