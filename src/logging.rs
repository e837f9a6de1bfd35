//! Log level selection and the stderr logger used by the binary.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "MOTOR_DIAG_LOG";

static STDERR_LOG_ONCE: Once = Once::new();

/// Level from `MOTOR_DIAG_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Parse `off`, `error`, `warn`, `info`, `debug` or `trace` (any case).
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger. Later calls are no-ops.
///
/// `verbosity` raises the environment level by one step per count
/// (`-v` → debug, `-vv` → trace).
pub fn init_stderr_logging(verbosity: u8) {
    let level = raise(env_level(), verbosity);
    STDERR_LOG_ONCE.call_once(|| {
        let env = Env::new().filter_or(LOG_ENV, level.as_str());
        let mut builder = env_logger::Builder::from_env(env);
        if verbosity > 0 {
            builder.filter_level(level);
        }
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

fn raise(level: LevelFilter, steps: u8) -> LevelFilter {
    let mut level = level;
    for _ in 0..steps {
        level = match level {
            LevelFilter::Off | LevelFilter::Error => LevelFilter::Warn,
            LevelFilter::Warn => LevelFilter::Info,
            LevelFilter::Info => LevelFilter::Debug,
            LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Trace,
        };
    }
    level
}
