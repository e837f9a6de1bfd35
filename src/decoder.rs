//! Bulk channel transfer decoder.
//!
//! After `<GV:n>` the controller answers with [`BLOCK_COUNT`] blocks, in
//! order, each framed as
//!
//! ```text
//! <NN:HHHHHHHH...HHHH>
//!  ^^ two-digit block index, 00..19
//!     ^^^^^^^^^^^^^^^ 40 hex characters = 10 big-endian 16-bit samples
//! ```
//!
//! Samples are two's-complement. The decoder walks the stream one block at a
//! time and stops at the first structural fault, so a dropped or duplicated
//! byte is caught at the block where it happened. A read either yields all
//! [`SAMPLES_PER_READ`] samples or a [`BlockFault`]; partial results are never
//! returned. Whatever the device is still sending after a fault is drained so
//! the next exchange starts on a clean line.

use log::{debug, warn};

use crate::command::Channel;
use crate::config::{
    ProtocolConfig, BLOCK_COUNT, HEX_PER_VALUE, PAYLOAD_LEN, SAMPLES_PER_READ, VALUES_PER_BLOCK,
};
use crate::errors::{BlockFault, Result};
use crate::link::{latin1, SerialLink};
use crate::matcher::MatchOutcome;

const TERMINATOR: u8 = b'>';

/// Decode 4 hex characters as a two's-complement 16-bit sample.
///
/// `"7FFF"` is 32767, `"8000"` is -32768, `"FFFF"` is -1.
pub fn decode_signed(hex: &[u8]) -> Option<i16> {
    if hex.len() != HEX_PER_VALUE || !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(hex).ok()?;
    u16::from_str_radix(text, 16).ok().map(|v| v as i16)
}

/// Decode one 40-character block payload into its samples, in order.
pub fn decode_payload(payload: &[u8]) -> Option<[i16; VALUES_PER_BLOCK]> {
    if payload.len() != PAYLOAD_LEN {
        return None;
    }
    let mut values = [0i16; VALUES_PER_BLOCK];
    for (slot, group) in values.iter_mut().zip(payload.chunks_exact(HEX_PER_VALUE)) {
        *slot = decode_signed(group)?;
    }
    Some(values)
}

/// Header announcing block `index`, e.g. `<07:`.
pub fn block_header(index: u8) -> String {
    format!("<{index:02}:")
}

enum Step {
    AwaitHeader(u8),
    ReadPayload(u8),
    AwaitTerminator(u8, Vec<u8>),
    Done,
}

/// One bulk read over a borrowed link.
pub struct BlockDecoder<'a> {
    link: &'a mut SerialLink,
    config: &'a ProtocolConfig,
}

impl<'a> BlockDecoder<'a> {
    pub fn new(link: &'a mut SerialLink, config: &'a ProtocolConfig) -> Self {
        Self { link, config }
    }

    /// Consume the block stream. On any failure the link is drained before
    /// the error is returned.
    pub fn read(mut self) -> Result<Vec<i16>> {
        match self.run() {
            Ok(samples) => Ok(samples),
            Err(e) => {
                warn!("block stream aborted: {}", e);
                if let Err(drain_err) = self.link.drain_available() {
                    warn!("drain after fault failed: {}", drain_err);
                }
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<Vec<i16>> {
        let mut samples = Vec::with_capacity(SAMPLES_PER_READ);
        let mut step = Step::AwaitHeader(0);
        loop {
            step = match step {
                Step::AwaitHeader(block) => {
                    self.await_header(block)?;
                    Step::ReadPayload(block)
                }
                Step::ReadPayload(block) => {
                    let payload = self.read_payload(block)?;
                    Step::AwaitTerminator(block, payload)
                }
                Step::AwaitTerminator(block, payload) => {
                    self.await_terminator(block)?;
                    let values = decode_payload(&payload).ok_or_else(|| BlockFault::NonHexData {
                        block,
                        received: latin1(&payload),
                    })?;
                    samples.extend_from_slice(&values);
                    if block + 1 < BLOCK_COUNT {
                        Step::AwaitHeader(block + 1)
                    } else {
                        Step::Done
                    }
                }
                Step::Done => {
                    debug!("block stream complete: {} samples", samples.len());
                    return Ok(samples);
                }
            };
        }
    }

    fn await_header(&mut self, block: u8) -> Result<()> {
        let expected = block_header(block);
        match self
            .link
            .match_any(&[expected.as_str()], self.config.header_timeout)?
        {
            MatchOutcome::Matched(_) => Ok(()),
            MatchOutcome::NoMatch { received } => Err(BlockFault::HeaderMismatch {
                block,
                expected,
                received: latin1(&received),
            }
            .into()),
        }
    }

    fn read_payload(&mut self, block: u8) -> Result<Vec<u8>> {
        let payload = self
            .link
            .read_exact_or_timeout(PAYLOAD_LEN, self.config.payload_timeout)?;

        // A terminator inside the payload means the block was cut short.
        if let Some(end) = payload.iter().position(|&b| b == TERMINATOR) {
            return Err(BlockFault::Truncated { block, got: end }.into());
        }
        if payload.len() < PAYLOAD_LEN {
            return Err(BlockFault::Truncated {
                block,
                got: payload.len(),
            }
            .into());
        }
        if !payload.iter().all(u8::is_ascii_hexdigit) {
            return Err(BlockFault::NonHexData {
                block,
                received: latin1(&payload),
            }
            .into());
        }
        Ok(payload)
    }

    fn await_terminator(&mut self, block: u8) -> Result<()> {
        let got = self
            .link
            .read_exact_or_timeout(1, self.config.terminator_timeout)?;
        match got.first() {
            Some(&TERMINATOR) => Ok(()),
            other => Err(BlockFault::TerminatorMismatch {
                block,
                got: other.map(|&b| b as char),
            }
            .into()),
        }
    }
}

impl SerialLink {
    /// Request `channel` and decode the complete answer.
    ///
    /// Stale input is drained before the request goes out.
    pub fn read_channel(&mut self, channel: Channel, config: &ProtocolConfig) -> Result<Vec<i16>> {
        self.drain_available()?;
        self.write(channel.request().as_bytes())?;
        debug!("channel {} requested", channel);
        BlockDecoder::new(self, config).read()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::errors::DriverError;
    use crate::link::mock::MockTransport;

    pub(crate) fn test_config() -> ProtocolConfig {
        ProtocolConfig::default()
            .with_header_timeout(Duration::from_millis(30))
            .with_payload_timeout(Duration::from_millis(20))
    }

    fn block(index: u8, payload: &str) -> String {
        format!("{}{}>", block_header(index), payload)
    }

    /// Well-formed answer where every sample is `value`.
    pub(crate) fn uniform_stream(value: &str) -> Vec<u8> {
        (0..BLOCK_COUNT)
            .map(|i| block(i, &value.repeat(VALUES_PER_BLOCK)))
            .collect::<String>()
            .into_bytes()
    }

    fn stream_with(index: u8, replacement: &str) -> Vec<u8> {
        let payload = "0001".repeat(VALUES_PER_BLOCK);
        (0..BLOCK_COUNT)
            .map(|i| {
                if i == index {
                    replacement.to_string()
                } else {
                    block(i, &payload)
                }
            })
            .collect::<String>()
            .into_bytes()
    }

    fn read(device: &MockTransport) -> (SerialLink, Result<Vec<i16>>) {
        let mut link = device.link();
        let result = link.read_channel(Channel::new(0).unwrap(), &test_config());
        (link, result)
    }

    fn fault(result: Result<Vec<i16>>) -> BlockFault {
        match result {
            Err(DriverError::Protocol(fault)) => fault,
            other => panic!("expected protocol fault, got {other:?}"),
        }
    }

    #[test]
    fn decode_signed_reference_values() {
        assert_eq!(decode_signed(b"8000"), Some(-32768));
        assert_eq!(decode_signed(b"7FFF"), Some(32767));
        assert_eq!(decode_signed(b"0000"), Some(0));
        assert_eq!(decode_signed(b"ffff"), Some(-1));
        assert_eq!(decode_signed(b"00G0"), None);
        assert_eq!(decode_signed(b"123"), None);
        assert_eq!(decode_signed(b"+123"), None);
    }

    #[test]
    fn decode_signed_is_twos_complement() {
        for raw in (0u32..=0xFFFF).step_by(97).chain([0x7FFF, 0x8000, 0xFFFF]) {
            let hex = format!("{raw:04X}");
            let expected = if raw >= 0x8000 {
                raw as i32 - 0x10000
            } else {
                raw as i32
            };
            assert_eq!(decode_signed(hex.as_bytes()).map(i32::from), Some(expected), "{hex}");
        }
    }

    #[test]
    fn full_stream_decodes_in_order() {
        let device = MockTransport::new();
        device.reply_on_write(&uniform_stream("0001"));

        let (_, result) = read(&device);
        let samples = result.unwrap();
        assert_eq!(samples.len(), SAMPLES_PER_READ);
        assert!(samples.iter().all(|&s| s == 1));
        assert_eq!(device.written(), b"<GV:0>");
    }

    #[test]
    fn sample_index_follows_block_and_group_order() {
        let stream: String = (0..BLOCK_COUNT)
            .map(|i| {
                let payload: String = (0..VALUES_PER_BLOCK)
                    .map(|k| format!("{:04X}", i as usize * VALUES_PER_BLOCK + k))
                    .collect();
                block(i, &payload)
            })
            .collect();
        let device = MockTransport::new();
        device.reply_on_write(stream.as_bytes());

        let samples = read(&device).1.unwrap();
        let expected: Vec<i16> = (0..SAMPLES_PER_READ as i16).collect();
        assert_eq!(samples, expected);
    }

    #[test]
    fn negative_samples_survive() {
        let device = MockTransport::new();
        device.reply_on_write(&uniform_stream("FF9C"));
        let samples = read(&device).1.unwrap();
        assert!(samples.iter().all(|&s| s == -100));
    }

    #[test]
    fn leading_noise_before_first_header_is_tolerated() {
        let device = MockTransport::new();
        let mut stream = b"\r\n".to_vec();
        stream.extend(uniform_stream("0002"));
        device.reply_on_write(&stream);
        assert_eq!(read(&device).1.unwrap().len(), SAMPLES_PER_READ);
    }

    #[test]
    fn stale_input_is_drained_before_request() {
        let device = MockTransport::new();
        device.inject(b"<19:leftover>");
        device.reply_on_write(&uniform_stream("0001"));
        assert!(read(&device).1.is_ok());
    }

    #[test]
    fn wrong_header_reports_block_and_drains() {
        let device = MockTransport::new();
        let payload = "0001".repeat(VALUES_PER_BLOCK);
        device.reply_on_write(&stream_with(7, &block(8, &payload)));

        let (mut link, result) = read(&device);
        let fault = fault(result);
        assert!(matches!(
            &fault,
            BlockFault::HeaderMismatch { block: 7, expected, .. } if expected == "<07:"
        ));
        assert!(link.drain_available().unwrap().is_empty());
    }

    #[test]
    fn short_payload_before_terminator_is_truncated() {
        let device = MockTransport::new();
        let short = block(4, &"0".repeat(39));
        device.reply_on_write(&stream_with(4, &short));

        let (mut link, result) = read(&device);
        assert_eq!(fault(result), BlockFault::Truncated { block: 4, got: 39 });
        assert_eq!(device.buffered(), 0);
        assert!(link.drain_available().unwrap().is_empty());
    }

    #[test]
    fn stream_ending_mid_payload_is_truncated() {
        let device = MockTransport::new();
        let mut stream = uniform_stream("0001");
        // Keep blocks 0..=1 and 39 characters of block 2's payload.
        let cut = 2 * 45 + 4 + 39;
        stream.truncate(cut);
        device.reply_on_write(&stream);

        assert_eq!(
            fault(read(&device).1),
            BlockFault::Truncated { block: 2, got: 39 }
        );
    }

    #[test]
    fn non_hex_payload_is_rejected() {
        let device = MockTransport::new();
        let bad = block(2, &format!("G{}", "0".repeat(39)));
        device.reply_on_write(&stream_with(2, &bad));

        let (mut link, result) = read(&device);
        assert!(matches!(fault(result), BlockFault::NonHexData { block: 2, .. }));
        assert!(link.drain_available().unwrap().is_empty());
    }

    #[test]
    fn wrong_terminator_is_reported() {
        let device = MockTransport::new();
        let bad = format!("{}{}X", block_header(0), "0".repeat(40));
        device.reply_on_write(&stream_with(0, &bad));

        let (mut link, result) = read(&device);
        assert_eq!(
            fault(result),
            BlockFault::TerminatorMismatch {
                block: 0,
                got: Some('X')
            }
        );
        assert!(link.drain_available().unwrap().is_empty());
    }

    #[test]
    fn missing_terminator_is_a_timeout() {
        let device = MockTransport::new();
        let mut stream = uniform_stream("0001");
        stream.truncate(19 * 45 + 44);
        device.reply_on_write(&stream);

        let fault = fault(read(&device).1);
        assert_eq!(
            fault,
            BlockFault::TerminatorMismatch {
                block: 19,
                got: None
            }
        );
        assert!(fault.to_string().ends_with("received timeout"));
    }

    #[test]
    fn silent_device_faults_on_first_header() {
        let device = MockTransport::new();
        let fault = fault(read(&device).1);
        assert!(matches!(
            fault,
            BlockFault::HeaderMismatch { block: 0, ref received, .. } if received.is_empty()
        ));
    }

    #[test]
    fn lost_port_is_not_a_protocol_fault() {
        let device = MockTransport::new();
        let mut link = device.link();
        device.disconnect();
        let result = link.read_channel(Channel::new(1).unwrap(), &test_config());
        assert!(matches!(result, Err(DriverError::Connection { .. })));
    }
}
