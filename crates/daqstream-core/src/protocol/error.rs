//! Protocol errors

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::layout::LayoutError;

/// Errors that can occur while talking to the front-end.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("serial port error: {0}")]
    Serial(String),

    #[error("response timeout")]
    Timeout,

    /// ASCII-mode reply began with `'?'`. Carries everything the device
    /// sent so the failure can be reconstructed without re-running.
    #[error("device rejected command: {raw:?}")]
    InvalidCommand { raw: String },

    /// Binary readback ended before the declared return layout arrived,
    /// even after the single residual-read retry. Timeout-class.
    #[error("short readback: expected {expected} bytes, got {got}")]
    ShortReadback { expected: usize, got: usize },

    /// A streaming frame's declared sample count implies more payload than
    /// the transport delivered. End-of-stream/corruption, not retried.
    #[error("frame length mismatch: expected {expected} bytes, got {got}")]
    FrameLength { expected: usize, got: usize },

    #[error("byte-stuffing decode failed")]
    Stuffing,

    #[error("bad sync byte {found:#04x}")]
    SyncByte { found: u8 },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_context() {
        let err = ProtocolError::ShortReadback {
            expected: 5,
            got: 3,
        };
        assert_eq!(err.to_string(), "short readback: expected 5 bytes, got 3");

        let err = ProtocolError::InvalidCommand {
            raw: "?unknown\nOK".to_string(),
        };
        assert!(err.to_string().contains("?unknown"));
    }
}
