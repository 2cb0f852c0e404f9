//! Process-wide tracing subscriber.
//!
//! `RUST_LOG` wins when set; otherwise the configured [`LogLevel`] applies.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Filter used when `RUST_LOG` is absent: our crates at this level,
    /// everything else (wasmtime, cranelift) at warn.
    pub fn default_directives(&self) -> String {
        CRATE_TARGETS
            .iter()
            .fold(String::from("warn"), |acc, target| {
                format!("{acc},{target}={}", self.as_str())
            })
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CRATE_TARGETS: [&str; 5] = [
    "roomagent_agent_runtime",
    "roomagent_state",
    "roomagent_keystore",
    "roomagent_settings",
    "roomagent_app",
];

/// Install the global subscriber. Fails if one is already set.
pub fn try_init(level: LogLevel) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.default_directives()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbose() {
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
    }

    #[test]
    fn test_directives_mention_level() {
        let d = LogLevel::Trace.default_directives();
        assert!(d.starts_with("warn,"));
        assert!(d.contains("roomagent_agent_runtime=trace"));
    }

    #[test]
    fn test_second_init_fails() {
        let _ = try_init(LogLevel::Info);
        assert!(try_init(LogLevel::Debug).is_err());
    }
}
