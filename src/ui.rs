//! Terminal UI for the bundled CLI: a progress gauge plus scrolling status
//! and log panes. `draw` throttles itself to `MIN_DRAW_INTERVAL`, the same
//! way the engine this crate wraps keeps its own internal pacing.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tui::backend::Backend;
use tui::layout::{Constraint, Direction, Layout};
use tui::style::{Color, Style};
use tui::widgets::{Block, Borders, Gauge, List, ListItem};
use tui::Terminal;

const MIN_DRAW_INTERVAL: Duration = Duration::from_millis(100);
const MAX_MESSAGES: usize = 200;

pub struct App {
    progress: u8,
    status: Vec<String>,
    log: Vec<String>,
    last_draw: Instant,
}

impl App {
    pub fn new() -> App {
        App {
            progress: 0,
            status: Vec::new(),
            log: Vec::new(),
            last_draw: Instant::now() - MIN_DRAW_INTERVAL,
        }
    }

    pub fn set_progress(&mut self, percent: u8) {
        self.progress = percent.min(100);
    }

    pub fn status(&mut self, message: impl ToString) {
        self.status.push(message.to_string());
        trim_to(&mut self.status, MAX_MESSAGES);
    }

    pub fn log(&mut self, message: impl ToString) {
        self.log.push(message.to_string());
        trim_to(&mut self.log, MAX_MESSAGES);
    }

    pub fn draw<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> std::io::Result<()> {
        if self.last_draw.elapsed() < MIN_DRAW_INTERVAL {
            return Ok(());
        }

        let progress = self.progress as u16;
        let status_items: Vec<ListItem> = self.status.iter().rev().take(10).map(|m| ListItem::new(m.as_str())).collect();
        let log_items: Vec<ListItem> = self.log.iter().rev().take(200).map(|m| ListItem::new(m.as_str())).collect();

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Length(12), Constraint::Min(5)].as_ref())
                .split(f.size());

            let gauge = Gauge::default()
                .block(Block::default().borders(Borders::ALL).title("Progress"))
                .gauge_style(Style::default().fg(Color::Green))
                .percent(progress);
            f.render_widget(gauge, chunks[0]);

            let status_list = List::new(status_items).block(Block::default().borders(Borders::ALL).title("Status"));
            f.render_widget(status_list, chunks[1]);

            let log_list = List::new(log_items).block(Block::default().borders(Borders::ALL).title("Log"));
            f.render_widget(log_list, chunks[2]);
        })?;

        self.last_draw = Instant::now();
        Ok(())
    }
}

/// Keeps only the most recent `max` entries, the way the teacher's own
/// `App::trim_messages` bounds its message list.
fn trim_to(messages: &mut Vec<String>, max: usize) {
    if messages.len() > max {
        let overflow = messages.len() - max;
        messages.drain(0..overflow);
    }
}

pub struct AppLogger {
    app_channel: Sender<String>,
}

impl AppLogger {
    pub fn new(chan: Sender<String>) -> AppLogger {
        AppLogger { app_channel: chan }
    }
}

impl log::Log for AppLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if record.level() > log::Level::Info {
            return;
        }
        let _ = self
            .app_channel
            .send(format!("{} {} {}", record.target(), record.level(), record.args()));
    }

    fn flush(&self) {}
}
