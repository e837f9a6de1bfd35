//! Serial byte channel.
//!
//! [`SerialLink`] owns the OS connection to the controller and offers the
//! primitive operations everything else is built from: writes, reads bounded
//! by a deadline, and draining of stale input. Every blocking read takes a
//! timeout; there is no unbounded read on this type.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use crate::errors::{DriverError, Result};

/// Timeout configured when the port is opened. Every read overrides it.
const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

/// Smallest timeout handed to the OS for a single read call.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Upper bound for one drain read; only already-buffered bytes are requested.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Cap on drain passes while the device keeps talking.
const MAX_DRAIN_PASSES: usize = 64;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Duplex byte transport behind a [`SerialLink`].
///
/// Implemented for real serial ports; tests plug in scripted transports.
pub trait Transport: Read + Write + Send {
    /// Number of received bytes already buffered by the OS.
    ///
    /// Also serves as the liveness probe: an error means the handle is dead.
    fn pending(&self) -> io::Result<usize>;

    /// Timeout applied to the next blocking read.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn pending(&self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

// ============================================================================
// Port discovery
// ============================================================================

/// A serial port reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or name to pass to [`SerialLink::open`] (e.g. `/dev/ttyUSB0`, `COM3`).
    pub name: String,
    pub description: String,
}

/// Enumerate the serial ports currently present.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    debug!("found {} serial port(s)", ports.len());
    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            name: p.port_name,
        })
        .collect())
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => match (&usb.product, &usb.manufacturer) {
            (Some(product), _) => product.clone(),
            (None, Some(manufacturer)) => manufacturer.clone(),
            (None, None) => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
        },
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "serial port".to_string(),
    }
}

// ============================================================================
// SerialLink
// ============================================================================

/// Exclusive owner of one connection to the controller.
pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    transport: Option<Box<dyn Transport>>,
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink {
    /// A link with no connection.
    pub fn new() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 0,
            transport: None,
        }
    }

    /// Open `port` at `baud_rate`, 8 data bits, no parity, 1 stop bit.
    pub fn open(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        self.ensure_closed()?;

        let serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| {
                warn!("failed to open serial port: port={}, error={}", port, e);
                DriverError::Connection {
                    port: port.to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!("connected: port={}, baud={}", port, baud_rate);
        self.port_name = port.to_string();
        self.baud_rate = baud_rate;
        self.transport = Some(Box::new(serial));
        Ok(())
    }

    /// Install an already-connected transport under `name`.
    pub fn attach(&mut self, name: &str, transport: Box<dyn Transport>) -> Result<()> {
        self.ensure_closed()?;
        debug!("transport attached: port={}", name);
        self.port_name = name.to_string();
        self.transport = Some(transport);
        Ok(())
    }

    /// Close the connection. Calling this without one is reported as
    /// [`DriverError::NotConnected`] and changes nothing.
    pub fn close(&mut self) -> Result<()> {
        match self.transport.take() {
            Some(_) => {
                info!("connection closed: port={}", self.port_name);
                Ok(())
            }
            None => {
                warn!("close requested but no connection is open");
                Err(DriverError::NotConnected)
            }
        }
    }

    /// Whether the OS handle is present and still answers.
    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.pending().is_ok())
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Write all of `data` and flush. Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = &self.port_name;
        let transport = self.transport.as_mut().ok_or(DriverError::NotConnected)?;
        transport
            .write_all(data)
            .and_then(|_| transport.flush())
            .map_err(|e| lost(port, e))?;
        trace!("tx {} byte(s): {:02X?} {:?}", data.len(), data, latin1(data));
        Ok(data.len())
    }

    /// Collect up to `n` bytes, giving up at `timeout`.
    ///
    /// A short result is not an error: callers detect truncation from the
    /// returned length.
    pub fn read_exact_or_timeout(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let port = &self.port_name;
        let transport = self.transport.as_mut().ok_or(DriverError::NotConnected)?;

        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            transport
                .set_read_timeout((deadline - now).max(MIN_READ_TIMEOUT))
                .map_err(|e| lost(port, e))?;
            match transport.read(&mut buf[filled..]) {
                Ok(count) => filled += count,
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(lost(port, e)),
            }
        }
        buf.truncate(filled);

        if filled < n {
            trace!("rx {}/{} byte(s) before timeout: {:?}", filled, n, latin1(&buf));
        } else {
            trace!("rx {} byte(s): {:?}", filled, latin1(&buf));
        }
        Ok(buf)
    }

    /// Read until `delimiter` (included in the result) or `timeout`.
    pub fn read_until_delimiter(&mut self, delimiter: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let byte = self.read_exact_or_timeout(1, deadline - now)?;
            let Some(&b) = byte.first() else {
                break;
            };
            data.push(b);
            if b == delimiter {
                break;
            }
        }
        Ok(data)
    }

    /// Take whatever input is already buffered without waiting for more.
    pub fn drain_available(&mut self) -> Result<Vec<u8>> {
        let mut drained = Vec::new();
        for _ in 0..MAX_DRAIN_PASSES {
            let pending = {
                let transport = self.transport.as_ref().ok_or(DriverError::NotConnected)?;
                transport.pending().map_err(|e| lost(&self.port_name, e))?
            };
            if pending == 0 {
                break;
            }
            let chunk = self.read_exact_or_timeout(pending, DRAIN_TIMEOUT)?;
            if chunk.is_empty() {
                break;
            }
            drained.extend_from_slice(&chunk);
        }
        if !drained.is_empty() {
            debug!(
                "drained {} stale byte(s): {:?}",
                drained.len(),
                latin1(&drained)
            );
        }
        Ok(drained)
    }

    fn ensure_closed(&mut self) -> Result<()> {
        if self.is_connected() {
            warn!("already connected: port={}", self.port_name);
            return Err(DriverError::AlreadyOpen(self.port_name.clone()));
        }
        if self.transport.take().is_some() {
            warn!("discarding dead connection: port={}", self.port_name);
        }
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn lost(port: &str, e: io::Error) -> DriverError {
    DriverError::Connection {
        port: port.to_string(),
        reason: e.to_string(),
    }
}

/// Render wire bytes one char per byte, the way the device encodes them.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ============================================================================
// Scripted transport for tests
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{SerialLink, Transport};

    #[derive(Default)]
    struct Inner {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<Vec<u8>>,
        timeout: Duration,
        disconnected: bool,
    }

    /// In-memory device. Reads on an empty buffer sleep for the configured
    /// timeout and then time out, like a quiet serial line.
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes as if the device had already sent them.
        pub fn inject(&self, data: &[u8]) {
            self.inner.lock().unwrap().incoming.extend(data);
        }

        /// Queue a response delivered after the next unanswered write.
        pub fn reply_on_write(&self, data: &[u8]) {
            self.inner.lock().unwrap().replies.push_back(data.to_vec());
        }

        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().unwrap().written.clone()
        }

        pub fn buffered(&self) -> usize {
            self.inner.lock().unwrap().incoming.len()
        }

        /// Simulate the device disappearing.
        pub fn disconnect(&self) {
            self.inner.lock().unwrap().disconnected = true;
        }

        /// A link already connected to this transport.
        pub fn link(&self) -> SerialLink {
            let mut link = SerialLink::new();
            link.attach("mock", Box::new(self.clone())).unwrap();
            link
        }
    }

    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let timeout = {
                let mut inner = self.inner.lock().unwrap();
                if inner.disconnected {
                    return Err(broken());
                }
                if !inner.incoming.is_empty() {
                    let n = buf.len().min(inner.incoming.len());
                    for (slot, byte) in buf.iter_mut().zip(inner.incoming.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                inner.timeout
            };
            std::thread::sleep(timeout);
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.disconnected {
                return Err(broken());
            }
            inner.written.extend_from_slice(buf);
            if let Some(reply) = inner.replies.pop_front() {
                inner.incoming.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn pending(&self) -> io::Result<usize> {
            let inner = self.inner.lock().unwrap();
            if inner.disconnected {
                return Err(broken());
            }
            Ok(inner.incoming.len())
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.inner.lock().unwrap().timeout = timeout;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn write_without_connection_is_rejected() {
        let mut link = SerialLink::new();
        assert!(matches!(link.write(b"<FS>"), Err(DriverError::NotConnected)));
        assert!(matches!(
            link.read_exact_or_timeout(1, SHORT),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn write_reports_byte_count() {
        let device = MockTransport::new();
        let mut link = device.link();
        assert_eq!(link.write(b"<GV:0>").unwrap(), 6);
        assert_eq!(device.written(), b"<GV:0>");
    }

    #[test]
    fn short_read_returns_what_arrived() {
        let device = MockTransport::new();
        device.inject(b"abc");
        let mut link = device.link();

        let started = Instant::now();
        let data = link.read_exact_or_timeout(5, SHORT).unwrap();
        assert_eq!(data, b"abc");
        assert!(started.elapsed() >= SHORT);
    }

    #[test]
    fn read_until_delimiter_stops_after_delimiter() {
        let device = MockTransport::new();
        device.inject(b"OK\nrest");
        let mut link = device.link();

        assert_eq!(link.read_until_delimiter(b'\n', SHORT).unwrap(), b"OK\n");
        assert_eq!(device.buffered(), 4);
    }

    #[test]
    fn read_until_delimiter_times_out_with_partial_data() {
        let device = MockTransport::new();
        device.inject(b"partial");
        let mut link = device.link();
        assert_eq!(link.read_until_delimiter(b'\n', SHORT).unwrap(), b"partial");
    }

    #[test]
    fn drain_takes_buffered_bytes_only() {
        let device = MockTransport::new();
        device.inject(b"stale<05:");
        let mut link = device.link();

        assert_eq!(link.drain_available().unwrap(), b"stale<05:");
        assert!(link.drain_available().unwrap().is_empty());
    }

    #[test]
    fn close_twice_reports_not_connected() {
        let device = MockTransport::new();
        let mut link = device.link();
        assert!(link.close().is_ok());
        assert!(!link.is_connected());
        assert!(matches!(link.close(), Err(DriverError::NotConnected)));
    }

    #[test]
    fn attach_refuses_while_connected() {
        let device = MockTransport::new();
        let mut link = device.link();
        let err = link.attach("other", Box::new(MockTransport::new()));
        assert!(matches!(err, Err(DriverError::AlreadyOpen(name)) if name == "mock"));
    }

    #[test]
    fn dead_transport_is_not_connected_and_can_be_replaced() {
        let device = MockTransport::new();
        let mut link = device.link();
        assert!(link.is_connected());

        device.disconnect();
        assert!(!link.is_connected());
        assert!(matches!(
            link.write(b"<FS>"),
            Err(DriverError::Connection { .. })
        ));

        let replacement = MockTransport::new();
        link.attach("mock2", Box::new(replacement)).unwrap();
        assert!(link.is_connected());
        assert_eq!(link.port_name(), "mock2");
    }

    #[test]
    fn open_missing_port_is_a_connection_error() {
        let mut link = SerialLink::new();
        let err = link.open("/dev/motor-diag-no-such-port", 57600);
        assert!(matches!(err, Err(DriverError::Connection { port, .. }) if port == "/dev/motor-diag-no-such-port"));
        assert!(!link.is_connected());
    }

    #[test]
    fn latin1_keeps_one_char_per_byte() {
        assert_eq!(latin1(&[b'<', 0xE9, b'>']), "<\u{e9}>");
    }
}
