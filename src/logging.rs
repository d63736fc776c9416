//! Tracing setup
//!
//! The engine logs through `tracing` macros with structured fields. This
//! module installs a `tracing-subscriber` registry with one fmt layer (pretty,
//! compact or JSON) behind an `EnvFilter`. `RUST_LOG` replaces the configured
//! directives entirely.
//!
//! Buffer pumps log every block at `trace`, so the pump target gets its own
//! level (`pump_level`) and stays quiet when the engine runs at `debug`.
//!
//! # Example
//! ```no_run
//! use daq_stream::{config::EngineConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load()?;
//! logging::init_from_config(&config)?;
//!
//! info!(device = "ai-0", rate = 1000.0, "Streaming");
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const PUMP_TARGET: &str = "daq_stream::pump";

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Level name not recognized
    #[error("Unknown log level '{0}' (expected trace, debug, info, warn or error)")]
    InvalidLevel(String),

    /// Directives rejected by `EnvFilter`
    #[error("Bad log filter: {0}")]
    Filter(String),

    /// Another subscriber is installed
    #[error("Could not install the log subscriber: {0}")]
    Init(String),
}

/// Line format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level of every target but the pump
    pub level: Level,
    /// Level of the per-block pump events
    pub pump_level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Emit span open and close events
    pub spans: bool,
    /// File and line of each event
    pub source_location: bool,
    /// Pump threads are named `pump-<device>`
    pub thread_names: bool,
    /// Colors, pretty format only
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Pretty output at `level`, pump events at `info`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            pump_level: Level::INFO,
            format: OutputFormat::default(),
            spans: false,
            source_location: false,
            thread_names: true,
            ansi: true,
        }
    }

    /// Level and format from the `[application]` section.
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self, LoggingError> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self::new(level).with_format(config.application.log_format))
    }

    /// Line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Level of the pump target.
    pub fn with_pump_level(mut self, level: Level) -> Self {
        self.pump_level = level;
        self
    }

    /// Emits span open and close events.
    pub fn with_spans(mut self, enabled: bool) -> Self {
        self.spans = enabled;
        self
    }

    /// Colors in pretty output.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        format!(
            "{},{}={}",
            self.level.as_str().to_lowercase(),
            PUMP_TARGET,
            self.pump_level.as_str().to_lowercase()
        )
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.directives())
                .map_err(|e| LoggingError::Filter(e.to_string())),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_thread_names(self.thread_names);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Installs the subscriber described by the `[application]` section.
pub fn init_from_config(config: &EngineConfig) -> Result<(), LoggingError> {
    init(TracingConfig::from_engine_config(config)?)
}

/// Installs the global subscriber.
///
/// Does nothing if one is already installed, so tests and embedding
/// applications may call it freely.
pub fn init(config: TracingConfig) -> Result<(), LoggingError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = config.filter()?;
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .or_else(|e| {
            // Lost a race with another initializer
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(LoggingError::Init(e.to_string()))
            }
        })
}

/// Parses a level name, ignoring case.
pub fn parse_log_level(level: &str) -> Result<Level, LoggingError> {
    if level.chars().all(|c| c.is_ascii_digit()) {
        return Err(LoggingError::InvalidLevel(level.to_string()));
    }
    Level::from_str(level.trim()).map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}
