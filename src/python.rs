use std::time::Duration;

use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;

use crate::command::Channel;
use crate::config::{ProtocolConfig, CHANNEL_COUNT, DEFAULT_BAUD_RATE, SAMPLES_PER_READ};
use crate::errors::DriverError;
use crate::link::{self, PortInfo};
use crate::pylog;
use crate::session::{ChannelRead, DiagSession};

// ============================================================================
// Error mapping
// ============================================================================

fn to_py(err: DriverError) -> PyErr {
    let message = err.to_string();
    match err {
        DriverError::Connection { .. } | DriverError::AlreadyOpen(_) | DriverError::NotConnected => {
            PyConnectionError::new_err(message)
        }
        DriverError::InvalidChannel(_) => PyValueError::new_err(message),
        DriverError::Timeout(_) => PyTimeoutError::new_err(message),
        DriverError::ReadInProgress(_)
        | DriverError::NoReadPending
        | DriverError::WorkerLost
        | DriverError::CommandNotAcknowledged { .. } => PyRuntimeError::new_err(message),
        DriverError::Io(_) | DriverError::Serial(_) | DriverError::Protocol(_) => {
            PyIOError::new_err(message)
        }
    }
}

// ============================================================================
// Python Bindings
// ============================================================================

/// Outcome of one channel read.
///
/// Attributes:
///     channel: Channel id (0-4).
///     samples: 200 signed samples in time order, or None if the read failed.
///     error: Failure description, or None on success.
#[pyclass(name = "ChannelRead", frozen)]
#[derive(Clone)]
struct PyChannelRead {
    #[pyo3(get)]
    channel: u8,
    #[pyo3(get)]
    samples: Option<Vec<i16>>,
    #[pyo3(get)]
    error: Option<String>,
}

#[pymethods]
impl PyChannelRead {
    /// True when all samples were received.
    #[getter]
    fn ok(&self) -> bool {
        self.samples.is_some()
    }

    fn __len__(&self) -> usize {
        self.samples.as_ref().map_or(0, Vec::len)
    }

    fn __repr__(&self) -> String {
        match (&self.samples, &self.error) {
            (Some(samples), _) => {
                format!("ChannelRead(channel={}, samples={})", self.channel, samples.len())
            }
            (None, error) => format!(
                "ChannelRead(channel={}, error={:?})",
                self.channel,
                error.as_deref().unwrap_or_default()
            ),
        }
    }
}

impl From<ChannelRead> for PyChannelRead {
    fn from(read: ChannelRead) -> Self {
        let (samples, error) = match read.outcome {
            Ok(samples) => (Some(samples), None),
            Err(e) => (None, Some(e.to_string())),
        };
        PyChannelRead {
            channel: read.channel.id(),
            samples,
            error,
        }
    }
}

/// A serial port present on this machine.
#[pyclass(name = "PortInfo", frozen)]
#[derive(Clone)]
struct PyPortInfo {
    #[pyo3(get)]
    name: String,
    #[pyo3(get)]
    description: String,
}

#[pymethods]
impl PyPortInfo {
    fn __repr__(&self) -> String {
        format!("PortInfo(name={:?}, description={:?})", self.name, self.description)
    }
}

impl From<PortInfo> for PyPortInfo {
    fn from(p: PortInfo) -> Self {
        PyPortInfo {
            name: p.name,
            description: p.description,
        }
    }
}

/// Diagnostic connection to a motor controller.
///
/// Channel reads run in the background: call request_channel(), then poll()
/// from a UI loop or wait() to block. Only one read may be in flight, and
/// every other call fails with RuntimeError until it has been collected.
///
/// Example:
///     >>> link = MotorLink()
///     >>> link.connect("/dev/ttyUSB0")
///     >>> link.request_channel(2)
///     >>> result = link.wait()
///     >>> result.samples[:5]
#[pyclass(name = "MotorLink", unsendable)]
struct PyMotorLink {
    session: DiagSession,
}

#[pymethods]
impl PyMotorLink {
    /// Args:
    ///     header_timeout_ms: Wait for each block header (default 100).
    ///     command_timeout_ms: Wait for a command echo (default 100).
    ///     retries: Attempts per command (default 2).
    #[new]
    #[pyo3(signature = (header_timeout_ms=None, command_timeout_ms=None, retries=None))]
    fn new(
        header_timeout_ms: Option<u64>,
        command_timeout_ms: Option<u64>,
        retries: Option<u32>,
    ) -> PyResult<Self> {
        let mut config = ProtocolConfig::default();
        if let Some(ms) = header_timeout_ms {
            config = config.with_header_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = command_timeout_ms {
            config = config.with_command_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = retries {
            config = config.with_command_retries(retries);
        }
        DiagSession::new(config)
            .map(|session| PyMotorLink { session })
            .map_err(to_py)
    }

    /// Open a serial port (8-N-1, no flow control).
    ///
    /// Raises:
    ///     ConnectionError: If the port cannot be opened or one is already open.
    #[pyo3(signature = (port, baud_rate=DEFAULT_BAUD_RATE))]
    fn connect(&mut self, port: &str, baud_rate: u32) -> PyResult<()> {
        self.session.open(port, baud_rate).map_err(to_py)
    }

    fn close(&mut self) -> PyResult<()> {
        self.session.close().map_err(to_py)
    }

    #[getter]
    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Channel being read in the background, or None.
    #[getter]
    fn read_in_progress(&self) -> Option<u8> {
        self.session.read_in_progress().map(Channel::id)
    }

    /// Start a background read of channel 0-4.
    ///
    /// Raises:
    ///     ValueError: If the channel id is out of range.
    ///     RuntimeError: If a read is already in progress.
    fn request_channel(&mut self, channel: u8) -> PyResult<()> {
        let channel = Channel::new(channel).map_err(to_py)?;
        self.session.request_channel(channel).map_err(to_py)
    }

    /// Finished read, or None while the read is running (or none was requested).
    fn poll(&mut self) -> Option<PyChannelRead> {
        self.session.poll_read().map(PyChannelRead::from)
    }

    /// Block until the running read completes. The GIL is released meanwhile.
    ///
    /// Raises:
    ///     TimeoutError: If the read is still running after timeout_ms; it can
    ///         be collected later.
    ///     RuntimeError: If no read was requested.
    #[pyo3(signature = (timeout_ms=None))]
    fn wait(&mut self, py: Python<'_>, timeout_ms: Option<u64>) -> PyResult<PyChannelRead> {
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.session.config().read_budget() * 2);
        let session = &mut self.session;
        py.detach(|| session.wait_read(timeout))
            .map(PyChannelRead::from)
            .map_err(to_py)
    }

    /// Send a raw command and wait for `expected` (the command's echo when
    /// omitted).
    ///
    /// Returns:
    ///     True if acknowledged within the allowed attempts.
    #[pyo3(signature = (command, expected=None, retries=None))]
    fn send_command(
        &mut self,
        command: &str,
        expected: Option<&str>,
        retries: Option<u32>,
    ) -> PyResult<bool> {
        let retries = retries.unwrap_or(self.session.config().command_retries);
        self.session
            .send_command_with_retry(command, expected.unwrap_or(command), retries)
            .map_err(to_py)
    }

    fn set_ac(&mut self, enabled: bool) -> PyResult<()> {
        self.session.set_ac(enabled).map_err(to_py)
    }

    /// Flip the AC stage.
    ///
    /// Returns:
    ///     The new state (True = enabled).
    fn toggle_ac(&mut self) -> PyResult<bool> {
        self.session.toggle_ac().map_err(to_py)
    }

    /// Last acknowledged AC state, or None if unknown.
    #[getter]
    fn ac_enabled(&self) -> Option<bool> {
        self.session.ac_enabled()
    }

    fn trigger_fs(&mut self) -> PyResult<()> {
        self.session.trigger_fs().map_err(to_py)
    }

    fn __repr__(&self) -> String {
        format!(
            "MotorLink(connected={}, ac_enabled={:?})",
            self.session.is_connected(),
            self.session.ac_enabled()
        )
    }
}

/// Serial ports currently present.
#[pyfunction(name = "list_ports")]
fn py_list_ports() -> PyResult<Vec<PyPortInfo>> {
    link::list_ports()
        .map(|ports| ports.into_iter().map(PyPortInfo::from).collect())
        .map_err(to_py)
}

/// Forward Rust log records to Python's `logging`.
#[pyfunction(name = "init_logging")]
fn py_init_logging(py: Python<'_>) -> PyResult<()> {
    pylog::init_python_logging(py)
}

/// Set the most verbose Rust level forwarded ("trace" ... "off"); None
/// re-reads MOTOR_DIAG_LOG.
#[pyfunction(name = "set_log_level")]
#[pyo3(signature = (level=None))]
fn py_set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    pylog::set_python_log_level(py, level)
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pylog::init_python_logging(m.py())?;

    m.add_class::<PyMotorLink>()?;
    m.add_class::<PyChannelRead>()?;
    m.add_class::<PyPortInfo>()?;
    m.add_function(wrap_pyfunction!(py_list_ports, m)?)?;
    m.add_function(wrap_pyfunction!(py_init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(py_set_log_level, m)?)?;

    m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
    m.add("SAMPLES_PER_READ", SAMPLES_PER_READ)?;
    m.add("CHANNEL_COUNT", CHANNEL_COUNT)?;

    Ok(())
}
