//! Bridge from the `log` facade into Python's `logging` module.
//!
//! Each Rust target (`_core::session`, `_core::decoder`, ...) maps to a
//! Python logger of the dotted name (`_core.session`), so applications
//! configure verbosity with ordinary `logging` calls. Effective levels are
//! cached per target; call [`reset_python_logger_cache`] after changing the
//! Python configuration.

use std::collections::HashMap;
use std::sync::{Mutex, Once};

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyModule, PyTuple};

use crate::logging::{env_level, parse_level};

static INSTALL_ONCE: Once = Once::new();
static BRIDGE: OnceCell<&'static PythonLogger> = OnceCell::new();

struct CachedLogger {
    handle: Py<PyAny>,
    enabled_up_to: LevelFilter,
}

struct PythonLogger {
    ceiling: Mutex<LevelFilter>,
    logging: Py<PyModule>,
    loggers: Mutex<HashMap<String, CachedLogger>>,
}

/// Numeric level used by Python's `logging`.
fn python_level(level: Level) -> u32 {
    match level {
        Level::Error => 40,
        Level::Warn => 30,
        Level::Info => 20,
        Level::Debug => 10,
        Level::Trace => 5,
    }
}

impl PythonLogger {
    fn new(py: Python<'_>, ceiling: LevelFilter) -> PyResult<Self> {
        Ok(Self {
            ceiling: Mutex::new(ceiling),
            logging: py.import("logging")?.into(),
            loggers: Mutex::new(HashMap::new()),
        })
    }

    fn ceiling(&self) -> LevelFilter {
        self.ceiling
            .lock()
            .map(|level| *level)
            .unwrap_or(LevelFilter::Off)
    }

    /// Python logger for `target` and the most verbose level it accepts.
    fn resolve(&self, py: Python<'_>, target: &str) -> PyResult<(Py<PyAny>, LevelFilter)> {
        if let Ok(cache) = self.loggers.lock() {
            if let Some(cached) = cache.get(target) {
                return Ok((cached.handle.clone_ref(py), cached.enabled_up_to));
            }
        }

        let logger = self.logging.bind(py).call_method1("getLogger", (target,))?;
        let mut enabled_up_to = LevelFilter::Off;
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
            if logger
                .call_method1("isEnabledFor", (python_level(level),))?
                .is_truthy()?
            {
                enabled_up_to = level.to_level_filter();
                break;
            }
        }

        let handle = logger.unbind();
        if let Ok(mut cache) = self.loggers.lock() {
            cache.insert(
                target.to_string(),
                CachedLogger {
                    handle: handle.clone_ref(py),
                    enabled_up_to,
                },
            );
        }
        Ok((handle, enabled_up_to))
    }

    fn emit(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
        let target = record.target().replace("::", ".");
        let (handle, enabled_up_to) = self.resolve(py, &target)?;
        if record.level().to_level_filter() > enabled_up_to {
            return Ok(());
        }

        let logger = handle.bind(py);
        let none = py.None();
        let py_record = logger.call_method1(
            "makeRecord",
            (
                target.as_str(),
                python_level(record.level()),
                record.file(),
                record.line().unwrap_or_default(),
                record.args().to_string(),
                PyTuple::empty(py),
                &none,
                &none,
                &none,
            ),
        )?;
        logger.call_method1("handle", (py_record,))?;
        Ok(())
    }
}

impl Log for PythonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level().to_level_filter() <= self.ceiling()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        Python::attach(|py| {
            if let Err(e) = self.emit(py, record) {
                e.restore(py);
            }
        });
    }

    fn flush(&self) {}
}

fn install(py: Python<'_>, ceiling: LevelFilter) -> PyResult<&'static PythonLogger> {
    BRIDGE
        .get_or_try_init(|| {
            PythonLogger::new(py, ceiling).map(|bridge| {
                let leaked: &'static PythonLogger = Box::leak(Box::new(bridge));
                leaked
            })
        })
        .copied()
}

/// Route Rust logs into Python's `logging`. Safe to call repeatedly; the
/// logger is registered once.
pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
    let level = env_level();
    let bridge = install(py, level)?;
    INSTALL_ONCE.call_once(|| {
        if log::set_logger(bridge).is_ok() {
            log::set_max_level(level);
        }
    });
    Ok(())
}

/// Forget cached per-target loggers and levels.
pub fn reset_python_logger_cache() {
    if let Some(bridge) = BRIDGE.get() {
        if let Ok(mut cache) = bridge.loggers.lock() {
            cache.clear();
        }
    }
}

/// Set the most verbose level forwarded to Python. `None` re-reads the
/// environment.
pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    let level = level.and_then(parse_level).unwrap_or_else(env_level);
    init_python_logging(py)?;
    if let Some(bridge) = BRIDGE.get() {
        if let Ok(mut ceiling) = bridge.ceiling.lock() {
            *ceiling = level;
        }
    }
    reset_python_logger_cache();
    log::set_max_level(level);
    Ok(())
}
