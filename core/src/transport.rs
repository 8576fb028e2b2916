//! The transport contract (spec §6): "issue one command, receive response
//! bytes." Framing, addressing, and retry on transient transport errors are
//! the transport's job; the engine treats a returned error as final for the
//! current command except where spec §4.4 calls for a retry.

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

/// Bootloader command opcodes (spec §6 on-wire protocol table).
pub mod opcode {
    pub const ENQUIRE: u8 = 0xF0;
    pub const PASSTHRU_ON: u8 = 0xF1;
    pub const PASSTHRU_OFF: u8 = 0xF2;
    pub const SELECT: u8 = 0xF3;
    pub const ERASE: u8 = 0xF8;
    pub const DATA: u8 = 0xF9;
    pub const VERIFY: u8 = 0xFA;
    pub const RESET: u8 = 0xFB;
    pub const ERASE_ALL: u8 = 0xFC;
    pub const FINISH: u8 = 0xFD;
}

/// Status bytes used by ACK/NACK-shaped responses.
pub const ACK: u8 = 0x00;
pub const NACK: u8 = 0xFF;

/// Per-command options the engine hands the transport: the response timeout
/// and, for retriable phases, how many attempts the transport itself may
/// spend retransmitting at its own layer (distinct from the engine's own
/// ENQUIRE/DATA retry loop in §4.4, which re-issues whole commands).
#[derive(Debug, Clone, Copy)]
pub struct CommandOptions {
    pub unit: u8,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// A thread-safe handle that can request cancellation of a transport's
/// in-flight command from another thread, without needing `&mut Transport`.
///
/// `Transport::cancel` takes `&mut self`, which a caller on another thread
/// can't obtain while `command` is blocked on the engine's thread — that's
/// exactly the situation `abort()` needs to interrupt (spec §5: "cancels
/// every registered pending transaction (best-effort transport cancel)",
/// an immediate effect of calling `abort()`, not something that waits for
/// the blocked command to return on its own). A `CancelHandle` is the
/// thread-safe side channel that makes that possible.
#[derive(Clone)]
pub struct CancelHandle(Arc<dyn Fn() + Send + Sync>);

impl CancelHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> CancelHandle {
        CancelHandle(Arc::new(f))
    }

    /// Requests cancellation. Idempotent; may be called from any thread at
    /// any time, including while a command is in flight.
    pub fn request(&self) {
        (self.0)()
    }
}

/// A single request/response transport, exclusively held for the duration
/// of one `start()` call (spec §5 "Shared resources").
pub trait Transport {
    /// Issues one command and blocks until a response arrives, the timeout
    /// elapses, or the command is cancelled.
    fn command(&mut self, op: u8, payload: &[u8], opts: CommandOptions) -> Result<Vec<u8>, TransportError>;

    /// Best-effort cancellation of whatever command is currently in flight.
    /// Called by `abort()`; a transport with nothing in flight may no-op.
    fn cancel(&mut self);

    /// Returns a handle an `AbortHandle` can hold onto (and move to another
    /// thread) to request cancellation of an in-flight `command` call
    /// without waiting for `&mut self` to become available.
    fn cancel_handle(&self) -> CancelHandle;
}

/// A scripted, in-memory transport used by this crate's own tests to drive
/// the engine through the scenarios in spec §8 without any real I/O. Not a
/// production transport — see `mbloader-serial` for one of those.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// One scripted reply: either a response, a timeout, or "drop this
    /// attempt" (used to simulate a device that misses its first ENQUIRE).
    #[derive(Debug, Clone)]
    pub enum Reply {
        Response(Vec<u8>),
        Timeout,
    }

    pub struct ScriptedTransport {
        replies: VecDeque<Reply>,
        pub commands_issued: Vec<(u8, Vec<u8>)>,
        cancelled: Arc<AtomicBool>,
    }

    impl ScriptedTransport {
        pub fn new(replies: Vec<Reply>) -> ScriptedTransport {
            ScriptedTransport {
                replies: replies.into(),
                commands_issued: Vec::new(),
                cancelled: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn was_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn command(&mut self, op: u8, payload: &[u8], _opts: CommandOptions) -> Result<Vec<u8>, TransportError> {
            self.commands_issued.push((op, payload.to_vec()));
            match self.replies.pop_front() {
                Some(Reply::Response(bytes)) => Ok(bytes),
                Some(Reply::Timeout) => Err(TransportError::Timeout),
                None => Err(TransportError::Timeout),
            }
        }

        fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn cancel_handle(&self) -> CancelHandle {
            let cancelled = Arc::clone(&self.cancelled);
            CancelHandle::new(move || cancelled.store(true, Ordering::SeqCst))
        }
    }
}
