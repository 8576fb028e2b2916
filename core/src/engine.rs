//! The bootload state machine (spec §4.4): a linear protocol with retries,
//! per-phase timeouts, cancellation, CRC pre-computation, and block
//! acknowledgement sequence-number checking.

use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BootloadError;
use crate::event::EventSink;
use crate::hex;
use crate::space::{SpaceConfig, TargetConfig};
use crate::transport::{opcode, CancelHandle, CommandOptions, Transport, ACK};

/// Where the HEX image comes from (spec §9: "Input source polymorphism").
pub enum HexSource<'a> {
    Path(&'a Path),
    Reader(&'a mut dyn BufRead),
}

/// Current phase of the state machine (spec §4.4 diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connecting,
    Connected,
    Selecting,
    Selected,
    Importing,
    Erasing,
    Sending,
    Verifying,
    Finishing,
    Done,
    Failed,
    Aborted,
}

/// A handle a caller can hold onto (and move to another thread) to cancel an
/// in-progress `start()` call. Cloning shares the same underlying flags.
#[derive(Clone)]
pub struct AbortHandle {
    in_progress: Arc<AtomicBool>,
    abort_requested: Arc<AtomicBool>,
    transport_cancel: CancelHandle,
}

impl AbortHandle {
    /// Requests cancellation. A no-op if no `start()` call is currently
    /// running (spec §5: "Abort invoked before `start` is effectively a
    /// no-op; invoked after Done/Failed is a no-op"), and idempotent if
    /// called more than once while one is.
    ///
    /// Besides flipping the flag `check_abort` polls between commands, this
    /// immediately requests cancellation of whatever command is currently
    /// in flight via the transport's `CancelHandle` (spec §5: "cancels every
    /// registered pending transaction (best-effort transport cancel)") —
    /// it does not wait for a blocked command to time out on its own.
    pub fn abort(&self) {
        if self.in_progress.load(Ordering::SeqCst) {
            self.abort_requested.store(true, Ordering::SeqCst);
            self.transport_cancel.request();
        }
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }
}

struct InProgressGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// One `start()` lifecycle against one transport (spec §3 `BootloadSession`).
pub struct BootloadSession<T: Transport> {
    transport: T,
    target: TargetConfig,
    space_index: usize,

    state: State,
    space: Option<SpaceConfig>,
    app_start: u32,
    app_end: u32,
    block_size: u16,
    target_version: (u8, u8),
    bl_scalar_version: u16,
    /// The device's reported command buffer size from ENQUIRE bytes 4-5
    /// (big-endian), or 0 if the response didn't carry them (spec §4.4
    /// CONNECTING: "Record `max_buffer = bufHi*256 + bufLo` (or 0 if
    /// absent)").
    max_buffer: u16,
    computed_crc: u16,
    flash_blocks: Vec<Vec<u8>>,
    total_blocks: usize,
    blocks_completed: usize,
    /// Opcodes of commands currently believed to be in flight. Only ever
    /// holds zero or one entry: the protocol is strictly sequential (spec §5).
    transactions: Vec<u8>,

    in_progress: Arc<AtomicBool>,
    abort_requested: Arc<AtomicBool>,
}

/// v4+ devices echo the block address in their DATA ACK; below this scalar
/// version the echo isn't present and isn't checked (spec §9, §4.4).
const SEQUENCE_CHECK_VERSION: u16 = 0x0401;

impl<T: Transport> BootloadSession<T> {
    pub fn new(transport: T, target: TargetConfig, space_index: usize) -> BootloadSession<T> {
        BootloadSession {
            transport,
            target,
            space_index,
            state: State::Init,
            space: None,
            app_start: 0,
            app_end: 0,
            block_size: 0,
            target_version: (0, 0),
            bl_scalar_version: 0,
            max_buffer: 0,
            computed_crc: 0,
            flash_blocks: Vec::new(),
            total_blocks: 0,
            blocks_completed: 0,
            transactions: Vec::new(),
            in_progress: Arc::new(AtomicBool::new(false)),
            abort_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle that can cancel this session from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            in_progress: Arc::clone(&self.in_progress),
            abort_requested: Arc::clone(&self.abort_requested),
            transport_cancel: self.transport.cancel_handle(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn computed_crc(&self) -> u16 {
        self.computed_crc
    }

    /// The device's reported command buffer size from ENQUIRE, or 0 if the
    /// response didn't carry one (spec §4.4 CONNECTING).
    pub fn max_buffer(&self) -> u16 {
        self.max_buffer
    }

    pub fn blocks_completed(&self) -> usize {
        self.blocks_completed
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Drives the whole protocol: connect, select, import, erase, send,
    /// verify, finish. Any failure is terminal for this session (spec §7) and
    /// triggers an implicit abort that cancels outstanding transactions and
    /// emits `status: Aborted`.
    pub fn start(&mut self, hex_source: HexSource<'_>, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.in_progress.store(true, Ordering::SeqCst);
        let _guard = InProgressGuard {
            flag: &self.in_progress,
        };

        let result = self.run(hex_source, sink);

        match &result {
            Ok(()) => self.state = State::Done,
            Err(e) => {
                self.state = if matches!(e, BootloadError::AbortedByUser) {
                    State::Aborted
                } else {
                    State::Failed
                };
                self.transport.cancel();
                self.transactions.clear();
                sink.status("Aborted");
                log::warn!("bootload session failed: {}", e);
            }
        }

        result
    }

    fn check_abort(&self) -> Result<(), BootloadError> {
        if self.abort_requested.load(Ordering::SeqCst) {
            Err(BootloadError::AbortedByUser)
        } else {
            Ok(())
        }
    }

    fn issue(&mut self, op: u8, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, BootloadError> {
        self.check_abort()?;
        self.transactions.push(op);
        let result = self.transport.command(
            op,
            payload,
            CommandOptions {
                unit: 0,
                timeout,
                max_retries: 0,
            },
        );
        self.transactions.pop();
        Ok(result?)
    }

    fn run(&mut self, hex_source: HexSource<'_>, sink: &dyn EventSink) -> Result<(), BootloadError> {
        let space = self
            .target
            .spaces
            .get(self.space_index)
            .cloned()
            .ok_or(BootloadError::UnsupportedDevice)?;

        self.connect(&space, sink)?;
        self.select(&space, sink)?;
        self.import(&space, hex_source, sink)?;
        self.erase(&space, sink)?;
        self.send(&space, sink)?;
        self.verify(&space, sink)?;
        self.finish(&space, sink)?;

        self.space = Some(space);
        Ok(())
    }

    fn connect(&mut self, space: &SpaceConfig, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Connecting;
        sink.status("Checking Communication");

        let attempts = self.target.enquire_retries + 1;
        let timeout = Duration::from_millis(self.target.timeouts.enquire_ms);

        let mut last_was_timeout = false;
        for _ in 0..attempts {
            self.check_abort()?;
            self.transactions.push(opcode::ENQUIRE);
            let outcome = self.transport.command(
                opcode::ENQUIRE,
                &[],
                CommandOptions {
                    unit: 0,
                    timeout,
                    max_retries: 0,
                },
            );
            self.transactions.pop();

            let response = match outcome {
                Ok(resp) => resp,
                Err(_timeout_or_io) => {
                    last_was_timeout = true;
                    continue;
                }
            };
            last_was_timeout = false;

            if response.len() < 4 {
                return Err(BootloadError::InvalidEnqResponse);
            }

            let vmaj = response[1];
            let vmin = response[2];
            let num_spaces = response[3] as usize;

            if !matches!(vmaj, 2 | 3 | 4) {
                return Err(BootloadError::UnsupportedVersion(vmaj));
            }
            if num_spaces < self.space_index + 1 {
                return Err(BootloadError::UnsupportedDevice);
            }

            self.target_version = (vmaj, vmin);
            self.bl_scalar_version = (vmaj as u16) * 256 + vmin as u16;
            self.max_buffer = if response.len() >= 6 {
                u16::from_be_bytes([response[4], response[5]])
            } else {
                0
            };
            self.state = State::Connected;
            sink.status("Connected");

            if let Some(delay_ms) = space.select_delay_ms {
                self.check_abort()?;
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
            return Ok(());
        }

        let _ = last_was_timeout;
        Err(BootloadError::NoResponseFromDevice)
    }

    fn select(&mut self, space: &SpaceConfig, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Selecting;
        sink.status("Selecting Memory");

        let timeout = Duration::from_millis(self.target.timeouts.select_ms);
        let response = match self.issue(opcode::SELECT, &[self.space_index as u8], timeout) {
            Ok(resp) => resp,
            Err(BootloadError::AbortedByUser) => return Err(BootloadError::AbortedByUser),
            Err(_) => return Err(BootloadError::InvalidSelectResponse),
        };

        if response.len() < 6 {
            return Err(BootloadError::InvalidSelectResponse);
        }

        self.block_size = u16::from_be_bytes([response[0], response[1]]);

        // The SELECT response shape is gated on major protocol version alone
        // (spec §4.4: "v2/v3 ... v4"), independent of `SEQUENCE_CHECK_VERSION`
        // (0x0401), which only governs the DATA-ACK address echo below. A
        // genuine v4.0 device (bl_scalar_version == 0x0400) still uses the
        // 6-byte block-number response, not the 10-byte absolute-address one.
        if self.target_version.0 < 4 {
            if response.len() < 10 {
                return Err(BootloadError::InvalidSelectResponse);
            }
            self.app_start = u32::from_be_bytes([response[2], response[3], response[4], response[5]]);
            self.app_end = u32::from_be_bytes([response[6], response[7], response[8], response[9]]);
        } else {
            let start_block = u16::from_be_bytes([response[2], response[3]]);
            let end_block = u16::from_be_bytes([response[4], response[5]]);
            self.app_start = start_block as u32 * self.block_size as u32;
            self.app_end = end_block as u32 * self.block_size as u32;
        }

        self.state = State::Selected;
        sink.status(&format!("Min Block Size: {}", self.block_size));
        sink.status(&format!("App Start: {:#x}", self.app_start));
        sink.status(&format!("App End: {:#x}", self.app_end));
        Ok(())
    }

    fn import(&mut self, space: &SpaceConfig, hex_source: HexSource<'_>, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Importing;
        sink.status("Loading File");
        self.check_abort()?;

        let mut blocks = match hex_source {
            HexSource::Path(path) => {
                let file = std::fs::File::open(path).map_err(|e| BootloadError::ParseError(e.to_string()))?;
                hex::parse(std::io::BufReader::new(file), space.hex_block)?
            }
            HexSource::Reader(reader) => hex::parse(reader, space.hex_block)?,
        };

        space.apply_load_filter(&mut blocks);

        let crc_start = (self.app_start as i64 - space.data_offset).max(0) as u32;
        let crc_end = (self.app_end as i64 - space.data_offset).max(0) as u32;
        self.computed_crc = space.checksum(crc_start, crc_end, &blocks);

        let mut flash_blocks = Vec::new();
        for (index, block) in blocks.iter() {
            let natural = crate::space::natural_address(index, block.len(), space.addressing, space.data_offset);
            if natural < self.app_start || natural >= self.app_end {
                continue;
            }
            if space.skip_empty_blocks && space.block_is_empty(block) {
                continue;
            }
            flash_blocks.push(space.send_filter(index, block));
        }

        self.total_blocks = flash_blocks.len();
        self.flash_blocks = flash_blocks;
        Ok(())
    }

    fn erase(&mut self, _space: &SpaceConfig, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Erasing;
        sink.status("Erasing");
        let start = Instant::now();

        let timeout = Duration::from_millis(self.target.timeouts.erase_ms);
        let response = self.issue(opcode::ERASE, &[], timeout)?;

        if response.first().copied() != Some(ACK) {
            return Err(BootloadError::EraseRejected);
        }

        sink.status(&format!("Erase Complete ({:.1} sec)", start.elapsed().as_secs_f32()));
        Ok(())
    }

    fn send(&mut self, space: &SpaceConfig, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Sending;
        sink.status("Sending...");
        let start = Instant::now();

        let timeout = Duration::from_millis(self.target.timeouts.data_ms);
        let total = self.flash_blocks.len();

        for index in 0..total {
            self.check_abort()?;
            let payload = self.flash_blocks[index].clone();

            let mut attempt = 0;
            loop {
                self.check_abort()?;
                self.transactions.push(opcode::DATA);
                let outcome = self.transport.command(
                    opcode::DATA,
                    &payload,
                    CommandOptions {
                        unit: 0,
                        timeout,
                        max_retries: 0,
                    },
                );
                self.transactions.pop();

                match outcome {
                    Ok(response) => {
                        let status_byte = response.first().copied().unwrap_or(0xFF);
                        if status_byte != ACK {
                            attempt += 1;
                            if attempt > self.target.data_retries {
                                return Err(BootloadError::UnexpectedDataResponse(status_byte));
                            }
                            continue;
                        }

                        if self.bl_scalar_version >= SEQUENCE_CHECK_VERSION {
                            if response.len() < 5 || payload.len() < 4 {
                                return Err(BootloadError::BlockOutOfSequence);
                            }
                            let echoed = &response[3..5];
                            let expected = &payload[2..4];
                            if echoed != expected {
                                return Err(BootloadError::BlockOutOfSequence);
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        if attempt > self.target.data_retries {
                            return Err(e.into());
                        }
                    }
                }
            }

            self.blocks_completed = index + 1;
            let pct = if total == 0 {
                100
            } else {
                (100 * self.blocks_completed / total) as u8
            };
            sink.progress(pct);
        }

        let _ = space;
        sink.status(&format!("Programming Complete ({:.1} sec)", start.elapsed().as_secs_f32()));
        Ok(())
    }

    fn verify(&mut self, _space: &SpaceConfig, sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Verifying;
        sink.status("Validating..");
        let start = Instant::now();

        let timeout = Duration::from_millis(self.target.timeouts.verify_ms);
        let response = self.issue(opcode::VERIFY, &[], timeout)?;

        if response.len() < 2 {
            return Err(BootloadError::ChecksumMismatch {
                expected: self.computed_crc,
                got: 0,
            });
        }

        let device_crc = (response[0] as u16) * 256 + response[1] as u16;
        if device_crc != self.computed_crc {
            return Err(BootloadError::ChecksumMismatch {
                expected: self.computed_crc,
                got: device_crc,
            });
        }

        sink.status(&format!(
            "Checksum: {:#06x} ({:.1} sec)",
            self.computed_crc,
            start.elapsed().as_secs_f32()
        ));
        Ok(())
    }

    fn finish(&mut self, _space: &SpaceConfig, _sink: &dyn EventSink) -> Result<(), BootloadError> {
        self.state = State::Finishing;

        let timeout = Duration::from_millis(self.target.timeouts.finish_ms);
        let response = self.issue(opcode::FINISH, &[], timeout)?;

        if response.first().copied() != Some(ACK) {
            return Err(BootloadError::FinishFailed);
        }
        Ok(())
    }
}
