//! A MODBUS-RTU-shaped serial [`Transport`](mbloader_core::transport::Transport)
//! for the bootload engine.
//!
//! Each command is framed as `[unit, opcode, len, payload..., crc_lo, crc_hi]`
//! with a little-endian CRC-16 (the same reflected polynomial the engine uses
//! for whole-image checksums — see [`mbloader_core::crc`]), and the device is
//! expected to echo `unit` and `opcode` back ahead of its own payload and CRC.
//! This is one illustrative pairing with the engine; any transport that
//! implements `Transport` works.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use mbloader_core::crc;
use mbloader_core::error::TransportError;
use mbloader_core::transport::{CancelHandle, CommandOptions, Transport};
use serialport::SerialPort;

/// Frames above this payload length are rejected as desync rather than
/// trusted and allocated.
const MAX_FRAME_PAYLOAD: usize = 4096;

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    cancel_requested: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<SerialTransport, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        log::info!("opened {} at {} baud", path, baud_rate);
        Ok(SerialTransport {
            port,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A clone of the flag `cancel()` sets. Exposed so a caller that also
    /// wants to interrupt a blocking open/read from another thread can share
    /// it ahead of time, the way `BootloadSession::abort_handle` does.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_requested)
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                return Err(TransportError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            match self.port.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn read_frame(&mut self, unit: u8, opcode: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.read_byte(deadline)? != unit {
                continue;
            }
            if self.read_byte(deadline)? != opcode {
                continue;
            }
            let len_hi = self.read_byte(deadline)?;
            let len_lo = self.read_byte(deadline)?;
            let len = u16::from_be_bytes([len_hi, len_lo]) as usize;
            if len > MAX_FRAME_PAYLOAD {
                log::warn!("serial: implausible frame length {}, resyncing", len);
                continue;
            }

            let mut payload = vec![0u8; len];
            for b in payload.iter_mut() {
                *b = self.read_byte(deadline)?;
            }
            let crc_lo = self.read_byte(deadline)?;
            let crc_hi = self.read_byte(deadline)?;
            let got_crc = u16::from_le_bytes([crc_lo, crc_hi]);

            if got_crc != frame_crc(unit, opcode, &payload) {
                log::warn!("serial: CRC mismatch on response, resyncing");
                continue;
            }

            return Ok(payload);
        }
    }
}

/// Builds one outgoing frame, CRC included.
fn encode_frame(unit: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len() + 2);
    frame.push(unit);
    frame.push(opcode);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = frame_crc(unit, opcode, payload);
    frame.write_u16::<LittleEndian>(crc).unwrap();
    frame
}

/// CRC covers everything but the CRC field itself: unit, opcode, length, payload.
fn frame_crc(unit: u8, opcode: u8, payload: &[u8]) -> u16 {
    let mut header = vec![unit, opcode];
    header.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    header.extend_from_slice(payload);
    crc::calc_crc16(&header)
}

impl Transport for SerialTransport {
    fn command(&mut self, op: u8, payload: &[u8], opts: CommandOptions) -> Result<Vec<u8>, TransportError> {
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }

        self.port
            .set_timeout(opts.timeout)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let frame = encode_frame(opts.unit, op, payload);
        let attempts = opts.max_retries + 1;
        let mut last_err = TransportError::Timeout;

        for _ in 0..attempts {
            self.port.write_all(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
            self.port.flush().map_err(|e| TransportError::Io(e.to_string()))?;

            match self.read_frame(opts.unit, op, opts.timeout) {
                Ok(response) => return Ok(response),
                Err(TransportError::Timeout) => {
                    last_err = TransportError::Timeout;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    fn cancel(&mut self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Built straight on [`cancel_flag`](SerialTransport::cancel_flag): both
    /// share the same `Arc<AtomicBool>` that `read_byte` polls, so requesting
    /// cancellation through this handle interrupts a blocked read on another
    /// thread without waiting for `&mut self` to free up.
    fn cancel_handle(&self) -> CancelHandle {
        let flag = self.cancel_flag();
        CancelHandle::new(move || flag.store(true, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_layout() {
        let frame = encode_frame(1, 0xF8, &[]);
        assert_eq!(&frame[0..2], &[1, 0xF8]);
        assert_eq!(&frame[2..4], &[0, 0]);
        assert_eq!(frame.len(), 6);
    }

    #[test]
    fn encode_frame_crc_matches_engine_crc() {
        let payload = [0xAAu8, 0xBB, 0xCC];
        let frame = encode_frame(2, 0xF9, &payload);
        let crc_bytes = &frame[frame.len() - 2..];
        let got = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        assert_eq!(got, frame_crc(2, 0xF9, &payload));
    }

    #[test]
    fn different_payloads_give_different_crcs() {
        let a = frame_crc(1, 0xF9, &[0x00]);
        let b = frame_crc(1, 0xF9, &[0x01]);
        assert_ne!(a, b);
    }
}
