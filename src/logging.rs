//! Tracing setup.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and one of three output
//! formats. `RUST_LOG` overrides the configured level. At `trace` the dispatch spans
//! (one per engine message) are logged as they open and close.
//!
//! # Example
//! ```no_run
//! use beamline_workflow::{config::WorkflowConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkflowConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("Broker started");
//! # Ok(())
//! # }
//! ```

use crate::config::WorkflowConfig;
use crate::error::{WorkflowError, WorkflowResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// Single line, no colours (beamline consoles)
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(WorkflowError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Resolved logging options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Most verbose level logged
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
}

impl LogSettings {
    /// Level and format from the `[application]` section.
    pub fn from_config(config: &WorkflowConfig) -> WorkflowResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.level == Level::TRACE {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()));
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(true)
            .with_line_number(self.level >= Level::DEBUG);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
            OutputFormat::Json => base.json().with_filter(filter).boxed(),
        }
    }
}

/// Initialise logging from the workflow configuration.
///
/// Calling this twice is not an error; the first subscriber stays in place.
pub fn init_from_config(config: &WorkflowConfig) -> WorkflowResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber for `settings`.
pub fn init(settings: LogSettings) -> WorkflowResult<()> {
    match tracing_subscriber::registry().with(settings.layer()).try_init() {
        Ok(()) => Ok(()),
        // Tests and embedding applications may have installed one already
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(WorkflowError::Configuration(format!(
            "Failed to initialise tracing: {e}"
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> WorkflowResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        WorkflowError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn settings_follow_application_section() {
        let mut config = WorkflowConfig::default();
        config.application.log_level = "trace".into();
        config.application.log_format = "json".into();

        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::TRACE);
        assert_eq!(settings.format, OutputFormat::Json);
        assert_eq!(settings.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn unknown_format_is_a_configuration_error() {
        let mut config = WorkflowConfig::default();
        config.application.log_format = "xml".into();
        assert!(matches!(
            LogSettings::from_config(&config),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn double_init_is_tolerated() {
        let settings = LogSettings {
            level: Level::ERROR,
            format: OutputFormat::Compact,
        };
        assert!(init(settings).is_ok());
        assert!(init(settings).is_ok());
    }
}
