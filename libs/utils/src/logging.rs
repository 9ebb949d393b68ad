//! Tracing setup with a runtime-reloadable level filter.
//!
//! The configured `log_level` comes from the proxy config file and can be
//! replaced on every config update, so the filter is installed behind a
//! reload handle instead of being baked into the subscriber.

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

/// Log levels accepted in the config file.
///
/// `off` disables logging entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            "critical" | "crit" => LogLevel::Critical,
            "off" | "none" => LogLevel::Off,
            _ => return None,
        })
    }

    pub fn as_name(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Off => "off",
        }
    }

    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            // tracing has no separate critical level; critical records are
            // emitted as errors with a `critical` field.
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_name())
    }
}

/// Handle for changing the global log level after startup.
#[derive(Clone)]
pub struct LogLevelHandle {
    reload: reload::Handle<LevelFilter, tracing_subscriber::Registry>,
}

impl LogLevelHandle {
    pub fn set(&self, level: LogLevel) -> anyhow::Result<()> {
        self.reload
            .reload(level.as_filter())
            .context("reloading log level filter")
    }
}

/// Initializes the global tracing subscriber.
///
/// Returns a handle that the config processor uses to apply `log_level`
/// changes from accepted configs.
pub fn init(initial: LogLevel) -> anyhow::Result<LogLevelHandle> {
    let (filter, reload) = reload::Layer::new(initial.as_filter());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LogLevelHandle { reload })
}
