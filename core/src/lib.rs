//! `mbloader-core` drives an Intel HEX firmware image onto an embedded
//! target over an arbitrary request/response transport: it parses the HEX
//! image into a sparse block store, applies a pluggable per-target memory
//! model, and runs the bootloader protocol state machine (ENQUIRE, SELECT,
//! ERASE, DATA, VERIFY, FINISH) against a caller-supplied [`transport::Transport`].
//!
//! The concrete transport (serial, CAN, BLE, ...) and any CLI front end are
//! out of scope here; see the `mbloader-serial` and `mbloader` crates in this
//! workspace for one illustrative pairing of the two.

pub mod crc;
pub mod engine;
pub mod error;
pub mod event;
pub mod hex;
pub mod profiles;
pub mod space;
pub mod transport;

pub use engine::{AbortHandle, BootloadSession, HexSource, State};
pub use error::{BootloadError, TransportError};
pub use event::{ChannelEventSink, Event, EventSink, NullSink};
pub use space::{ChecksumKind, ExcludeRange, LoadFilter, ProductCode, SpaceConfig, SpaceKind, TargetConfig};
pub use transport::{CommandOptions, Transport};
