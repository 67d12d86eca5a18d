//! Logging infrastructure - structured tracing throughout the engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level, format and destination
//! - Zero-cost when disabled (hot paths only log on slow-path events)
//! - Optional daily-rolling file output through a non-blocking writer

use crate::config::LogSection;
use crate::stats::Stats;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use tracing::{debug, info, trace, warn, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file writer alive until [`flush`] runs.
static LOG_GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rolling file
    File { directory: String, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives (e.g. "retainer::rc=trace")
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Start from the `[log]` section of the runtime config
    pub fn from_section(section: &LogSection) -> Self {
        let mut config = Self::default();
        config.level = parse_level(&section.level).unwrap_or(Level::WARN);
        if section.json {
            config.format = LogFormat::Json;
        }
        if let Some(directory) = &section.file {
            config.output = LogOutput::File {
                directory: directory.display().to_string(),
                prefix: "retainer".to_string(),
            };
        }
        config.span_events = section.spans;
        config
    }

    /// Apply `RETAINER_LOG_*` variables from `lookup` on top of `self`
    pub fn overlay(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = self;

        // RETAINER_LOG_LEVEL: trace, debug, info, warn, error
        if let Some(level) = lookup("RETAINER_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::WARN);
        }

        // RETAINER_LOG_FILE: directory for daily-rolling log files
        if let Some(directory) = lookup("RETAINER_LOG_FILE") {
            config.output = LogOutput::File {
                directory,
                prefix: "retainer".to_string(),
            };
        }

        if lookup("RETAINER_LOG_JSON").is_some() {
            config.format = LogFormat::Json;
        }

        if lookup("RETAINER_LOG_SPANS").is_some() {
            config.span_events = true;
        }
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Parse a level name as used in config files and environment variables
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging from the environment (idempotent)
pub fn init() {
    if LOGGER_INITIALIZED.get().is_some() {
        return;
    }
    let config = LogConfig::from_section(&crate::config::current().log)
        .overlay(|key| std::env::var(key).ok());
    if let Some(guard) = init_logging(config) {
        *LOG_GUARD.lock() = Some(guard);
    }
}

/// Install a global subscriber for `config`.
///
/// Returns the writer guard for file output; it must be kept alive for
/// buffered lines to reach disk. Only the first call in a process installs
/// a subscriber, later calls return `None`.
pub fn init_logging(config: LogConfig) -> Option<WorkerGuard> {
    let mut result = None;

    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter(&config);
        let span_events = span_events_config(config.span_events);

        let (writer, guard) = match &config.output {
            LogOutput::Stdout => (BoxMakeWriter::new(io::stdout), None),
            LogOutput::Stderr => (BoxMakeWriter::new(io::stderr), None),
            LogOutput::File { directory, prefix } => {
                let appender = rolling::daily(directory, prefix);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                (BoxMakeWriter::new(non_blocking), Some(guard))
            }
        };

        // Another subscriber may already be installed by the host program
        let installed = match config.format {
            LogFormat::Pretty => {
                let layer = fmt::layer()
                    .with_writer(writer)
                    .pretty()
                    .with_span_events(span_events)
                    .with_filter(filter);
                tracing_subscriber::registry().with(layer).try_init().is_ok()
            }
            LogFormat::Compact => {
                let layer = fmt::layer()
                    .with_writer(writer)
                    .compact()
                    .with_target(true)
                    .with_thread_ids(cfg!(debug_assertions))
                    .with_span_events(span_events)
                    .with_filter(filter);
                tracing_subscriber::registry().with(layer).try_init().is_ok()
            }
            LogFormat::Json => {
                let layer = fmt::layer()
                    .with_writer(writer)
                    .json()
                    .with_span_events(span_events)
                    .with_filter(filter);
                tracing_subscriber::registry().with(layer).try_init().is_ok()
            }
        };

        if installed {
            result = guard;
        }
    });

    result
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Drop the file writer guard, flushing buffered lines
pub fn flush() {
    LOG_GUARD.lock().take();
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .fold(base, |filter, directive| match directive.trim().parse() {
                Ok(parsed) => filter.add_directive(parsed),
                Err(_) => filter,
            }),
        None => base,
    }
}

fn span_events_config(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

// ============================================================================
// Engine event helpers
// ============================================================================

#[inline]
pub fn log_allocation(class: &str, size: usize, address: usize) {
    trace!(
        target: "retainer::object",
        event = "allocation",
        class,
        size_bytes = size,
        address = format_args!("{:#x}", address),
        "object allocated"
    );
}

#[inline]
pub fn log_deallocation(address: usize, fast_path: bool) {
    trace!(
        target: "retainer::object",
        event = "deallocation",
        address = format_args!("{:#x}", address),
        fast_path,
        "object deallocated"
    );
}

/// Inline count overflowed; `moved` owners now live in the side table
#[inline]
pub fn log_overflow(address: usize, moved: usize) {
    trace!(
        target: "retainer::rc",
        event = "overflow",
        address = format_args!("{:#x}", address),
        moved,
        "inline refcount spilled to side table"
    );
}

/// Inline count underflowed and `borrowed` owners came back from the side table
#[inline]
pub fn log_underflow(address: usize, borrowed: usize) {
    trace!(
        target: "retainer::rc",
        event = "underflow",
        address = format_args!("{:#x}", address),
        borrowed,
        "borrowed refcount back from side table"
    );
}

#[inline]
pub fn log_weak_clear(address: usize, slots: usize) {
    trace!(
        target: "retainer::weak",
        event = "weak_clear",
        address = format_args!("{:#x}", address),
        slots,
        "weak slots cleared"
    );
}

pub fn log_weak_mismatch(slot: usize, holds: usize, expected: usize) {
    warn!(
        target: "retainer::weak",
        event = "weak_mismatch",
        slot = format_args!("{:#x}", slot),
        holds = format_args!("{:#x}", holds),
        expected = format_args!("{:#x}", expected),
        "weak slot holds a different object than registered; weak store/load misuse"
    );
}

pub fn log_class_registered(name: &str, index: u32) {
    debug!(target: "retainer::class", event = "class_registered", name, index, "class registered");
}

pub fn log_pool_leak(address: usize) {
    warn!(
        target: "retainer::pool",
        event = "pool_leak",
        address = format_args!("{:#x}", address),
        "object autoreleased with no pool in place; just leaking"
    );
}

pub fn log_class_changed(address: usize, from: u64, to: u32, inline: bool) {
    debug!(
        target: "retainer::class",
        event = "class_changed",
        address = format_args!("{:#x}", address),
        from,
        to,
        inline,
        "object class changed"
    );
}

pub fn log_unknown_class_free(address: usize) {
    warn!(
        target: "retainer::object",
        event = "unknown_class",
        address = format_args!("{:#x}", address),
        "deallocated object has no registered class; storage not reclaimed"
    );
}

pub fn log_ffi_error(function: &str, error: &str) {
    warn!(target: "retainer::ffi", event = "ffi_error", function, error, "FFI call failed");
}

pub fn log_runtime_shutdown(stats: &Stats) {
    info!(
        target: "retainer",
        event = "runtime_shutdown",
        objects_allocated = stats.objects_allocated,
        objects_freed = stats.objects_freed,
        overflow_spills = stats.overflow_spills,
        underflow_borrows = stats.underflow_borrows,
        weak_slots_cleared = stats.weak_slots_cleared,
        "retainer runtime shutting down"
    );
}
