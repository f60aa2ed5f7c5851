use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WeftError};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Buffer size of the runtime event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Timeout applied to execs that do not set one. 0 disables it.
    #[serde(default)]
    pub default_timeout_ms: u64,
}

impl FlowConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Include the event target in formatted output.
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            with_target: false,
        }
    }
}

fn default_log_filter() -> String {
    "weft=info,warn".to_string()
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Config file not readable");
            WeftError::ConfigNotFound(path.display().to_string())
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded runtime config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| {
            warn!(error = %e, "Invalid runtime config");
            WeftError::Config(e.to_string())
        })
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_FILTER", "weft=debug");
        let result = expand_env_vars("filter = \"${TEST_WEFT_FILTER}\"");
        assert_eq!(result, "filter = \"weft=debug\"");
        std::env::remove_var("TEST_WEFT_FILTER");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.scope.event_capacity, 256);
        assert_eq!(config.flow.default_timeout(), None);
        assert_eq!(config.log.filter, "weft=info,warn");
    }

    #[test]
    fn test_partial_sections() {
        let config = RuntimeConfig::from_toml_str(
            r#"
[flow]
default_timeout_ms = 1500
"#,
        )
        .unwrap();
        assert_eq!(
            config.flow.default_timeout(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.scope.event_capacity, 256);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RuntimeConfig::from_toml_str("[scope\nevent_capacity = ").unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }
}
