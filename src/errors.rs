use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("connection error on {port}: {reason}")]
    Connection { port: String, reason: String },
    #[error("already connected to {0}")]
    AlreadyOpen(String),
    #[error("not connected")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(#[from] BlockFault),
    #[error("command {command:?} not acknowledged after {attempts} attempt(s)")]
    CommandNotAcknowledged { command: String, attempts: u32 },
    #[error("invalid channel {0} (valid channels are 0-4)")]
    InvalidChannel(u8),
    #[error("channel {0} read already in progress")]
    ReadInProgress(u8),
    #[error("no channel read in progress")]
    NoReadPending,
    #[error("read worker exited without delivering a result")]
    WorkerLost,
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Structural fault in the bulk block stream.
///
/// `block` is always the index of the block being consumed when the fault was
/// detected. Empty received data renders as `timeout`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockFault {
    #[error("block {block}: expected header {expected:?}, received {}", shown(.received))]
    HeaderMismatch {
        block: u8,
        expected: String,
        received: String,
    },
    #[error("block {block}: expected 40 hex characters, received {got}")]
    Truncated { block: u8, got: usize },
    #[error("block {block}: non-hexadecimal payload {received:?}")]
    NonHexData { block: u8, received: String },
    #[error("block {block}: expected '>' terminator, received {}", shown_char(.got))]
    TerminatorMismatch { block: u8, got: Option<char> },
}

impl BlockFault {
    /// Index of the block that faulted.
    pub fn block(&self) -> u8 {
        match self {
            BlockFault::HeaderMismatch { block, .. }
            | BlockFault::Truncated { block, .. }
            | BlockFault::NonHexData { block, .. }
            | BlockFault::TerminatorMismatch { block, .. } => *block,
        }
    }
}

fn shown(received: &str) -> String {
    if received.is_empty() {
        "timeout".to_string()
    } else {
        format!("{received:?}")
    }
}

fn shown_char(got: &Option<char>) -> String {
    match got {
        Some(c) => format!("{c:?}"),
        None => "timeout".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
