//! Duplex command/response and streaming-batch protocol
//!
//! Implements the host side of the front-end's serial protocol: per-command
//! request/response exchanges in both the human-readable ASCII encoding and
//! the packed binary encoding, plus the high-rate framed hit stream emitted
//! during a batch acquisition.

pub mod batch;
pub mod channel;
pub mod codec;
mod error;
pub mod frame;
pub mod serial;
mod session;

pub use batch::{BatchMode, BatchSink, FileSink, MemorySink, NullSink};
pub use channel::{CommunicationChannel, SerialChannel, TcpChannel};
pub use codec::CommandResponse;
pub use error::ProtocolError;
pub use frame::{Frame, FrameReader};
pub use serial::{list_ports, open_port, PortInfo};
pub use session::{
    BatchHandle, BatchOutcome, BatchSummary, CommsMode, Session, SessionConfig,
};

/// Default device line rate once a fixed baud is negotiated.
pub const DEFAULT_BAUD_RATE: u32 = 1_181_818;

/// Default response / stream-idle timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

/// Settle interval before verbose readbacks and stop-handshake drains, in
/// milliseconds. Long enough for a frame already in flight to finish.
pub const DEFAULT_SETTLE_MS: u64 = 500;

/// Priming character the device's autobaud detector locks onto.
pub const AUTOBAUD_PRIME: u8 = b'U';

/// ASCII-mode response terminator.
pub const ASCII_TERMINATOR: [u8; 3] = *b"OK\n";

/// Upper bound on a single poll-loop read.
pub(crate) const READ_CHUNK: usize = 512;
