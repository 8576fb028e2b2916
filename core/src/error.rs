use std::fmt;

/// Everything that can go wrong on the transport side of a single command.
///
/// This is deliberately small: framing, addressing, and retrying transient
/// transport errors are the transport's job (spec §6). The engine only ever
/// sees one of these three outcomes for a command it issued.
#[derive(Debug)]
pub enum TransportError {
    /// No response arrived within the command's timeout.
    Timeout,
    /// The transport itself failed (port closed, framing error, ...).
    Io(String),
    /// The command was cancelled by `abort()` before it completed.
    Cancelled,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "no response within timeout"),
            TransportError::Io(msg) => write!(f, "transport error: {}", msg),
            TransportError::Cancelled => write!(f, "command cancelled"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Every way a `start()` call can end in failure.
///
/// Each variant is terminal for the session: spec §7 is explicit that no
/// error is recovered higher than the engine, and that any terminal error
/// triggers an implicit `abort()`.
#[derive(Debug)]
pub enum BootloadError {
    // --- transport / communication ---
    /// All ENQUIRE retries were exhausted without a response.
    NoResponseFromDevice,
    /// An ENQUIRE response arrived but was too short to parse.
    InvalidEnqResponse,
    /// A SELECT response arrived but was too short to parse.
    InvalidSelectResponse,

    // --- version / compatibility ---
    /// The device reported a bootloader major version we don't support.
    UnsupportedVersion(u8),
    /// The device reports fewer memory spaces than the one requested.
    UnsupportedDevice,

    // --- device-rejected ---
    /// ERASE was answered with anything other than ACK.
    EraseRejected,
    /// A DATA command was answered with anything other than ACK.
    UnexpectedDataResponse(u8),
    /// A v4+ device echoed an address that didn't match the block sent.
    BlockOutOfSequence,
    /// FINISH was answered with anything other than ACK.
    FinishFailed,

    // --- verification ---
    /// The locally computed CRC didn't match the device's.
    ChecksumMismatch { expected: u16, got: u16 },

    // --- parse ---
    /// A HEX line failed structural or checksum validation.
    InvalidHexLine(usize),
    /// A HEX record used a type byte with no defined meaning (not 0/1/2/3/4/5).
    UnknownRecordType(u8),
    /// A HEX record used a type byte this parser refuses to process (2, 3, 5).
    UnsupportedRecordType(u8),
    /// The input ended before an END_OF_FILE record was seen.
    IncompleteFile,
    /// One or more lines failed to parse; carries the first failure's message.
    ParseError(String),

    // --- control ---
    /// The caller invoked `abort()`.
    AbortedByUser,

    /// The underlying transport failed.
    Transport(TransportError),
}

impl fmt::Display for BootloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootloadError::NoResponseFromDevice => write!(f, "no response from device"),
            BootloadError::InvalidEnqResponse => write!(f, "invalid ENQUIRE response"),
            BootloadError::InvalidSelectResponse => write!(f, "invalid SELECT response"),
            BootloadError::UnsupportedVersion(v) => write!(f, "unsupported bootloader version {}", v),
            BootloadError::UnsupportedDevice => write!(f, "device does not have the requested memory space"),
            BootloadError::EraseRejected => write!(f, "device rejected ERASE"),
            BootloadError::UnexpectedDataResponse(b) => write!(f, "unexpected DATA response byte 0x{:02x}", b),
            BootloadError::BlockOutOfSequence => write!(f, "device echoed an address out of sequence"),
            BootloadError::FinishFailed => write!(f, "device rejected FINISH"),
            BootloadError::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected 0x{:04x}, got 0x{:04x}", expected, got)
            }
            BootloadError::InvalidHexLine(n) => write!(f, "invalid HEX line {}", n),
            BootloadError::UnknownRecordType(t) => write!(f, "unknown HEX record type {}", t),
            BootloadError::UnsupportedRecordType(t) => write!(f, "unsupported HEX record type {}", t),
            BootloadError::IncompleteFile => write!(f, "HEX input ended without an END_OF_FILE record"),
            BootloadError::ParseError(msg) => write!(f, "HEX parse error: {}", msg),
            BootloadError::AbortedByUser => write!(f, "aborted by user"),
            BootloadError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BootloadError {}

impl From<TransportError> for BootloadError {
    fn from(e: TransportError) -> Self {
        BootloadError::Transport(e)
    }
}
