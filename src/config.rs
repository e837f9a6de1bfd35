//! Protocol constants and tunable timing.

use std::time::Duration;

/// Baud rate of the reference controller firmware.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Number of selectable data channels (`<GV:0>` .. `<GV:4>`).
pub const CHANNEL_COUNT: u8 = 5;

/// Blocks per bulk transfer.
pub const BLOCK_COUNT: u8 = 20;

/// Samples carried by one block.
pub const VALUES_PER_BLOCK: usize = 10;

/// Hex characters per sample.
pub const HEX_PER_VALUE: usize = 4;

/// Payload length of one block in bytes.
pub const PAYLOAD_LEN: usize = VALUES_PER_BLOCK * HEX_PER_VALUE;

/// Samples returned by a complete channel read.
pub const SAMPLES_PER_READ: usize = BLOCK_COUNT as usize * VALUES_PER_BLOCK;

const HEADER_TIMEOUT: Duration = Duration::from_millis(100);
const PAYLOAD_TIMEOUT: Duration = Duration::from_millis(25);
const TERMINATOR_TIMEOUT: Duration = Duration::from_millis(25);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_RETRIES: u32 = 2;

/// Timing used by the matcher, dispatcher and block decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub baud_rate: u32,
    /// Budget for matching one `<NN:` block header.
    pub header_timeout: Duration,
    /// Budget for the 40 payload bytes of one block.
    pub payload_timeout: Duration,
    /// Budget for the closing `>` of one block.
    pub terminator_timeout: Duration,
    /// Per-attempt budget when waiting for a command acknowledgement.
    pub command_timeout: Duration,
    /// Attempts made by the command helpers on the session.
    pub command_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            header_timeout: HEADER_TIMEOUT,
            payload_timeout: PAYLOAD_TIMEOUT,
            terminator_timeout: TERMINATOR_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            command_retries: COMMAND_RETRIES,
        }
    }
}

impl ProtocolConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn with_payload_timeout(mut self, timeout: Duration) -> Self {
        self.payload_timeout = timeout;
        self
    }

    pub fn with_terminator_timeout(mut self, timeout: Duration) -> Self {
        self.terminator_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the number of command attempts. Zero is raised to one.
    pub fn with_command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries.max(1);
        self
    }

    /// Worst-case duration of one complete channel read.
    pub fn read_budget(&self) -> Duration {
        (self.header_timeout + self.payload_timeout + self.terminator_timeout)
            * BLOCK_COUNT as u32
    }
}
