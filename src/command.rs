//! Controller command set and acknowledged command dispatch.

use std::fmt;
use std::time::Duration;

use log::{debug, warn};

use crate::config::CHANNEL_COUNT;
use crate::errors::{DriverError, Result};
use crate::link::{latin1, SerialLink};
use crate::matcher::MatchOutcome;

/// Disable the AC stage. Echoed back as acknowledgement.
pub const CMD_AC_DISABLE: &str = "<CA:0>";
/// Enable the AC stage. Echoed back as acknowledgement.
pub const CMD_AC_ENABLE: &str = "<CA:1>";
/// Trigger the auxiliary `FS` action. Echoed back as acknowledgement.
pub const CMD_AUX_ACTION: &str = "<FS>";

/// A data channel of the controller (`<GV:0>` .. `<GV:4>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub fn new(id: u8) -> Result<Self> {
        if id < CHANNEL_COUNT {
            Ok(Self(id))
        } else {
            Err(DriverError::InvalidChannel(id))
        }
    }

    pub fn id(self) -> u8 {
        self.0
    }

    /// Request text for this channel's bulk transfer.
    pub fn request(self) -> String {
        format!("<GV:{}>", self.0)
    }

    pub fn all() -> impl Iterator<Item = Channel> {
        (0..CHANNEL_COUNT).map(Channel)
    }
}

impl TryFrom<u8> for Channel {
    type Error = DriverError;

    fn try_from(id: u8) -> Result<Self> {
        Channel::new(id)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SerialLink {
    /// Send `command` until `expected` comes back, at most `retries` times.
    ///
    /// Returns `false` when every attempt went unanswered. Channel failures
    /// (no connection, port lost) are returned as errors instead.
    pub fn send_with_retry(
        &mut self,
        command: &str,
        expected: &str,
        retries: u32,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(self
            .send_with_responses_retry(command, &[expected], retries, timeout)?
            .is_some())
    }

    /// Like [`send_with_retry`](Self::send_with_retry) but accepts any of
    /// `expected` and returns the one that arrived.
    pub fn send_with_responses_retry(
        &mut self,
        command: &str,
        expected: &[&str],
        retries: u32,
        timeout: Duration,
    ) -> Result<Option<String>> {
        for attempt in 1..=retries {
            // The command is written again on every attempt.
            self.write(command.as_bytes())?;
            debug!("command sent: command={:?}, attempt={}", command, attempt);

            match self.match_any(expected, timeout)? {
                MatchOutcome::Matched(found) => {
                    debug!(
                        "command acknowledged: command={:?}, response={:?}, attempt={}",
                        command, found, attempt
                    );
                    return Ok(Some(found));
                }
                MatchOutcome::NoMatch { received } => {
                    debug!(
                        "command unanswered: command={:?}, attempt={}, received={:?}",
                        command,
                        attempt,
                        latin1(&received)
                    );
                }
            }
        }

        warn!(
            "command not acknowledged: command={:?}, attempts={}",
            command, retries
        );
        Ok(None)
    }
}
