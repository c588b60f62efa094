use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::PrettyFields;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
    #[error("invalid logging level: `{0}`")]
    InvalidLevel(String),
}

/// Logging settings of the harness. `RUST_LOG` takes precedence over the configured level.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    fn level_filter(&self) -> Result<LevelFilter, LoggingError> {
        LevelFilter::from_str(&self.level).map_err(|_| LoggingError::InvalidLevel(self.level.clone()))
    }

    /// Installs the global tracing subscriber.
    pub fn try_init(&self) -> Result<(), LoggingError> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.level_filter()?.into())
            .from_env_lossy();

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.show_target)
            .fmt_fields(PrettyFields::new())
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError(
                    "unable to set envtest global logging subscriber".to_string(),
                )
            })
    }
}
