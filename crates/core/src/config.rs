//! Proxy configuration.
//!
//! Every knob is overridable through `TOOLGATE_*` environment variables; an
//! optional TOML file (pointed at by `TOOLGATE_CONFIG`) supplies the base
//! values. Defaults match a stock JetBrains IDE: the built-in server listens
//! on the first free port in `63342..63352`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Client persona selecting the active tool catalog view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    #[default]
    Codex,
    Cc,
}

impl FromStr for ToolMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "codex" => Ok(ToolMode::Codex),
            "cc" => Ok(ToolMode::Cc),
            _ => Err(ConfigError::InvalidValue {
                key: "tool_mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ToolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolMode::Codex => write!(f, "codex"),
            ToolMode::Cc => write!(f, "cc"),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// First upstream port probed during discovery.
    #[serde(default = "default_first_port")]
    pub first_port: u16,

    /// Number of consecutive ports probed.
    #[serde(default = "default_ports_count")]
    pub ports_count: u16,

    /// Per-port handshake attempt bound, seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole discovery scan bound, seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Forwarded tool call bound, seconds.
    #[serde(default = "default_tool_call_timeout_secs")]
    pub tool_call_timeout_secs: u64,

    #[serde(default)]
    pub tool_mode: ToolMode,

    /// Project root injected into `project_path`-shaped parameters.
    #[serde(default = "default_project_path")]
    pub project_path: PathBuf,
}

fn default_first_port() -> u16 {
    63342
}

fn default_ports_count() -> u16 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    2
}

fn default_scan_timeout_secs() -> u64 {
    20
}

fn default_tool_call_timeout_secs() -> u64 {
    120
}

fn default_project_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            first_port: default_first_port(),
            ports_count: default_ports_count(),
            connect_timeout_secs: default_connect_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            tool_call_timeout_secs: default_tool_call_timeout_secs(),
            tool_mode: ToolMode::default(),
            project_path: default_project_path(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration: TOML file if `TOOLGATE_CONFIG` names one,
    /// defaults otherwise, then `TOOLGATE_*` environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TOOLGATE_CONFIG") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup closure. Split out from
    /// [`ProxyConfig::load`] so tests do not touch process-wide state.
    pub fn apply_env_from<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = get("TOOLGATE_FIRST_PORT") {
            self.first_port = parse("TOOLGATE_FIRST_PORT", v)?;
        }
        if let Some(v) = get("TOOLGATE_PORTS_COUNT") {
            self.ports_count = parse("TOOLGATE_PORTS_COUNT", v)?;
        }
        if let Some(v) = get("TOOLGATE_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = parse("TOOLGATE_CONNECT_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("TOOLGATE_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = parse("TOOLGATE_SCAN_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("TOOLGATE_TOOL_CALL_TIMEOUT_SECS") {
            self.tool_call_timeout_secs = parse("TOOLGATE_TOOL_CALL_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("TOOLGATE_TOOL_MODE") {
            self.tool_mode = v.parse()?;
        }
        if let Some(v) = get("TOOLGATE_PROJECT_PATH") {
            self.project_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }

    /// Candidate upstream ports, in probe order.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.ports_count).filter_map(|i| self.first_port.checked_add(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.first_port, 63342);
        assert_eq!(config.ports_count, 10);
        assert_eq!(config.tool_mode, ToolMode::Codex);
        assert_eq!(config.tool_call_timeout(), Duration::from_secs(120));
        assert_eq!(config.ports().collect::<Vec<_>>()[..3], [63342, 63343, 63344]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ProxyConfig::default();
        config
            .apply_env_from(|key| match key {
                "TOOLGATE_FIRST_PORT" => Some("7000".to_string()),
                "TOOLGATE_PORTS_COUNT" => Some("3".to_string()),
                "TOOLGATE_TOOL_MODE" => Some("cc".to_string()),
                "TOOLGATE_PROJECT_PATH" => Some("/tmp/project".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.first_port, 7000);
        assert_eq!(config.ports().collect::<Vec<_>>(), vec![7000, 7001, 7002]);
        assert_eq!(config.tool_mode, ToolMode::Cc);
        assert_eq!(config.project_path, PathBuf::from("/tmp/project"));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ProxyConfig::default();
        let err = config
            .apply_env_from(|key| (key == "TOOLGATE_FIRST_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("codex".parse::<ToolMode>().unwrap(), ToolMode::Codex);
        assert_eq!("CC".parse::<ToolMode>().unwrap(), ToolMode::Cc);
        assert!("vim".parse::<ToolMode>().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config: ProxyConfig = toml::from_str(
            r#"
            first_port = 9000
            tool_mode = "cc"
            project_path = "/work"
            "#,
        )
        .unwrap();
        assert_eq!(config.first_port, 9000);
        assert_eq!(config.tool_mode, ToolMode::Cc);
        // Unspecified keys fall back to defaults.
        assert_eq!(config.ports_count, 10);
    }

    #[test]
    fn test_port_range_does_not_overflow() {
        let config = ProxyConfig {
            first_port: 65534,
            ports_count: 10,
            ..Default::default()
        };
        assert_eq!(config.ports().collect::<Vec<_>>(), vec![65534, 65535]);
    }
}
