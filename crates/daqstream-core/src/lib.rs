//! # DaqStream core library
//!
//! Host-side protocol engine for serial-attached data-acquisition
//! front-ends.
//!
//! This library provides:
//! - The command catalog shared with the front-end firmware
//! - ASCII and binary command encoding, readback decoding
//! - A transport session driving request/response exchanges and the
//!   streaming batch receive loop
//! - Frame reassembly for the high-rate hit stream, online and offline
//!
//! ## Example
//!
//! ```rust,ignore
//! use daqstream_core::catalog::Catalog;
//! use daqstream_core::layout::Value;
//! use daqstream_core::protocol::{Session, SessionConfig};
//!
//! let catalog = Catalog::builtin();
//! let mut session = Session::open("/dev/ttyUSB0", catalog, SessionConfig::default())?;
//!
//! let status = session.send_recv_named("status", &[])?;
//! println!("{}", status.text());
//!
//! session.send_recv_named("pulser_start", &[Value::Int(1000)])?;
//! ```

pub mod catalog;
pub mod layout;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{Catalog, CommandSpec, ResponseCode, ServiceId};
    pub use crate::layout::{ArgLayout, Value};
    pub use crate::protocol::{
        BatchHandle, BatchMode, BatchOutcome, BatchSink, BatchSummary, CommandResponse,
        CommsMode, FileSink, Frame, FrameReader, MemorySink, ProtocolError, Session,
        SessionConfig,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
