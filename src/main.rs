//! Demo CLI front end for `mbloader-core`: takes a serial port, baud rate,
//! target profile name, and HEX path on argv, drives a `BootloadSession` over
//! `mbloader-serial` on a worker thread, and renders progress with a
//! `termion`+`tui` dashboard — `select!` over keyboard input, a log channel,
//! and the engine's own event channel, the way the teacher's dashboard loop
//! selects over keyboard, network, and log channels alongside a redraw tick.
//!
//! This binary, and the serial transport it links against, are illustrative:
//! the engine in `mbloader-core` has no dependency on either.
//!
//! Exit codes: `0` success, `1` bootload failure, `101` transport/terminal
//! open failure.

mod ui;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{select, unbounded};
use termion::event::Key;
use termion::input::TermRead;
use termion::raw::IntoRawMode;
use tui::backend::TermionBackend;
use tui::Terminal;

use mbloader_core::{profiles, BootloadSession, ChannelEventSink, Event, HexSource};
use mbloader_serial::SerialTransport;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: {} <serial-port> <baud-rate> <profile> <hex-file>", args[0]);
        std::process::exit(1);
    }

    let port_path = args[1].clone();
    let baud_rate: u32 = match args[2].parse() {
        Ok(b) => b,
        Err(_) => {
            eprintln!("invalid baud rate: {}", args[2]);
            std::process::exit(1);
        }
    };
    let profile_name = args[3].clone();
    let hex_path = PathBuf::from(&args[4]);

    let target = match profiles::lookup(&profile_name) {
        Some(t) => t,
        None => {
            eprintln!("unknown target profile: {}", profile_name);
            std::process::exit(1);
        }
    };

    let (log_tx, log_rx) = unbounded();
    let _ = log::set_boxed_logger(Box::new(ui::AppLogger::new(log_tx)));
    log::set_max_level(log::LevelFilter::Info);

    let transport = match SerialTransport::open(&port_path, baud_rate) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to open {}: {}", port_path, e);
            std::process::exit(101);
        }
    };

    let stdout = match io::stdout().into_raw_mode() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open terminal: {}", e);
            std::process::exit(101);
        }
    };
    let backend = TermionBackend::new(stdout);
    let mut terminal = match Terminal::new(backend) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to init terminal: {}", e);
            std::process::exit(101);
        }
    };
    let _ = terminal.clear();

    let mut app = ui::App::new();

    let mut session = BootloadSession::new(transport, target, 0);
    let abort_handle = session.abort_handle();

    let (event_tx, event_rx) = unbounded();
    let sink = ChannelEventSink::new(event_tx);

    let (done_tx, done_rx) = unbounded();
    let worker = std::thread::spawn(move || {
        let result = session.start(HexSource::Path(&hex_path), &sink);
        let _ = done_tx.send(result);
    });

    let (kbd_tx, kbd_rx) = unbounded();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for key in stdin.keys().flatten() {
            if kbd_tx.send(key).is_err() {
                return;
            }
        }
    });

    let mut exit_code = 0;
    'ui: loop {
        select! {
            recv(kbd_rx) -> key => {
                if let Ok(key) = key {
                    if matches!(key, Key::Esc | Key::Ctrl('c') | Key::Char('q')) {
                        abort_handle.abort();
                        app.status("Abort requested");
                    }
                }
            }
            recv(event_rx) -> evt => {
                if let Ok(evt) = evt {
                    match evt {
                        Event::Status(message) => app.status(message),
                        Event::Progress(percent) => app.set_progress(percent),
                    }
                }
            }
            recv(log_rx) -> message => {
                if let Ok(message) = message {
                    app.log(message);
                }
            }
            recv(done_rx) -> result => {
                exit_code = match result {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        app.status(format!("FAILED: {}", e));
                        1
                    }
                    Err(_) => 1,
                };
                let _ = app.draw(&mut terminal);
                std::thread::sleep(Duration::from_millis(500));
                break 'ui;
            }
            default(Duration::from_millis(100)) => {}
        }
        let _ = app.draw(&mut terminal);
    }

    let _ = worker.join();
    std::process::exit(exit_code);
}
