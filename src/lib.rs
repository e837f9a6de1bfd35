//! Motor controller diagnostic link, with optional Python bindings.
//!
//! The controller speaks a short ASCII protocol over a serial line
//! (57600 baud, 8-N-1):
//!
//! - `<GV:n>` requests channel `n` (0-4). The controller answers with 20
//!   blocks `<NN:` + 40 hex digits + `>`, each carrying ten 16-bit
//!   two's-complement samples, 200 samples in total.
//! - `<CA:0>` / `<CA:1>` disable / enable the AC stage; `<FS>` fires the
//!   auxiliary action. Each is acknowledged by echoing the command.
//!
//! # Layers
//!
//! 1. [`SerialLink`] owns the port: open/close, timed reads, input drain.
//! 2. [`SerialLink::match_any`] waits for one of several expected responses.
//! 3. [`SerialLink::send_with_retry`] sends a command until it is acknowledged.
//! 4. [`BlockDecoder`] validates and decodes the 20-block stream.
//! 5. [`DiagSession`] runs channel reads in the background and rejects
//!    anything that would overlap one.
//!
//! The `python` feature builds the `_core` extension module.

mod command;
mod config;
mod decoder;
mod errors;
mod link;
mod logging;
mod matcher;
mod session;

#[cfg(feature = "python")]
mod pylog;
#[cfg(feature = "python")]
mod python;

pub use command::{Channel, CMD_AC_DISABLE, CMD_AC_ENABLE, CMD_AUX_ACTION};
pub use config::{
    ProtocolConfig, BLOCK_COUNT, CHANNEL_COUNT, DEFAULT_BAUD_RATE, SAMPLES_PER_READ,
    VALUES_PER_BLOCK,
};
pub use decoder::{block_header, decode_payload, decode_signed, BlockDecoder};
pub use errors::*;
pub use link::{list_ports, PortInfo, SerialLink, Transport};
pub use logging::{init_stderr_logging, LOG_ENV};
pub use matcher::MatchOutcome;
pub use session::{ChannelRead, DiagSession};
