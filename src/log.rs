//! Structured logging for maestro.
//!
//! All components log through `tracing` macros. This module installs the
//! subscriber once at startup.
//!
//! Log levels:
//! - ERROR: Critical recovery failures surfaced to operators
//! - WARN: Recoverable per-unit failures and degraded workers
//! - INFO: Coordination actions, scaling decisions, applied optimizations
//! - DEBUG: Per-cycle summaries
//! - TRACE: Individual load samples and signal values
//!
//! Debug mode can be enabled with `--debug` flag or `MAESTRO_DEBUG=1` env var.
//! `MAESTRO_LOG` accepts a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const FILTER_ENV: &str = "MAESTRO_LOG";
const DEBUG_ENV: &str = "MAESTRO_DEBUG";

/// Initialize logging to ~/.maestro/maestro.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the home directory is unavailable or the log
/// file cannot be created. Calling this twice is harmless; the second
/// subscriber install is ignored.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
        EnvFilter::new(default_directive(debug_enabled))
    });

    let registry = tracing_subscriber::registry().with(filter);

    match open_log_file() {
        Some(file) => {
            let _ = registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init();
        }
        None => {
            let _ = registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();
        }
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "maestro=debug"
    } else {
        "maestro=info"
    }
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".maestro");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("maestro.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}
