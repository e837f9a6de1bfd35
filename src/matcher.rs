//! Waiting for expected responses on the byte channel.
//!
//! Matching is containment, not equality: bytes received before a candidate
//! (line noise, the tail of an earlier exchange) do not prevent a match. The
//! matcher reads no further than the byte that completes the match, so the
//! data following it stays in the channel for the next reader.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::Result;
use crate::link::{latin1, SerialLink};

/// Result of waiting for one of several responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The candidate found in the received bytes.
    Matched(String),
    /// Deadline passed; `received` holds everything read while waiting.
    NoMatch { received: Vec<u8> },
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched(candidate) => Some(candidate),
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

impl SerialLink {
    /// Wait until the received bytes contain one of `candidates`.
    ///
    /// Reads a first chunk the size of the shortest candidate, then one byte
    /// at a time until the deadline. If several candidates are contained at
    /// once, the first in `candidates` order wins.
    pub fn match_any(&mut self, candidates: &[&str], timeout: Duration) -> Result<MatchOutcome> {
        let Some(shortest) = candidates.iter().map(|c| c.len()).min() else {
            warn!("response match requested without candidates");
            return Ok(MatchOutcome::NoMatch {
                received: Vec::new(),
            });
        };

        let deadline = Instant::now() + timeout;
        let mut received = self.read_exact_or_timeout(shortest, timeout)?;
        loop {
            if let Some(found) = find_candidate(&received, candidates) {
                debug!("response matched: {:?}", found);
                return Ok(MatchOutcome::Matched(found.to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let byte = self.read_exact_or_timeout(1, deadline - now)?;
            received.extend_from_slice(&byte);
        }

        debug!(
            "no response matched: expected one of {:?}, received {:?}",
            candidates,
            latin1(&received)
        );
        Ok(MatchOutcome::NoMatch { received })
    }

    /// Single-candidate form of [`match_any`](Self::match_any).
    pub fn check_response(&mut self, expected: &str, timeout: Duration) -> Result<bool> {
        Ok(self.match_any(&[expected], timeout)?.matched().is_some())
    }
}

fn find_candidate<'a>(received: &[u8], candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .find(|c| contains(received, c.as_bytes()))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
