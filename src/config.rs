use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9899;
pub const DEFAULT_BED_COUNT: usize = 20;
pub const DEFAULT_SEND_ALARMS: bool = true;

pub const ENV_IP: &str = "IP";
pub const ENV_PORT: &str = "PORT";
pub const ENV_BED_COUNT: &str = "BED_COUNT";
pub const ENV_SEND_ALARMS: &str = "SEND_ALARMS";

/// Startup failures. All of these are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read template {path}: {source}")]
    TemplateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {name} template at byte {offset}: {reason}")]
    TemplateSyntax {
        name: String,
        offset: usize,
        reason: String,
    },
    #[error("failed to read alarm dictionary {path}: {source}")]
    AlarmDictionary {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("no alarms found in alarm dictionary {0}")]
    EmptyAlarmDictionary(String),
}

/// Hub target and fleet shape, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub ip: String,
    pub port: u16,
    pub bed_count: usize,
    pub send_alarms: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            bed_count: DEFAULT_BED_COUNT,
            send_alarms: DEFAULT_SEND_ALARMS,
        }
    }
}

impl SimulatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset and empty values
    /// fall back to the baseline.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(ip) = get(ENV_IP) {
            config.ip = ip;
        }

        if let Some(port) = get(ENV_PORT) {
            config.port = port.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv {
                    key: ENV_PORT,
                    value: port.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(count) = get(ENV_BED_COUNT) {
            config.bed_count = count.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv {
                    key: ENV_BED_COUNT,
                    value: count.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(flag) = get(ENV_SEND_ALARMS) {
            config.send_alarms = parse_bool(&flag).ok_or_else(|| ConfigError::InvalidEnv {
                key: ENV_SEND_ALARMS,
                value: flag.clone(),
                reason: "expected one of 1, t, T, TRUE, true, True, 0, f, F, FALSE, false, False"
                    .to_string(),
            })?;
        }

        Ok(config)
    }

    /// `host:port` of the receiving hub.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for SimulatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}, {} beds, send_alarms = {}",
            self.ip, self.port, self.bed_count, self.send_alarms
        )
    }
}

/// Boolean spellings accepted for `SEND_ALARMS`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SimulatorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SimulatorConfig::default());
        assert_eq!(config.address(), "127.0.0.1:9899");
        assert_eq!(config.bed_count, 20);
        assert!(config.send_alarms);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = SimulatorConfig::from_lookup(lookup_from(&[
            ("IP", "10.1.2.3"),
            ("PORT", "6661"),
            ("BED_COUNT", "150"),
            ("SEND_ALARMS", "F"),
        ]))
        .unwrap();

        assert_eq!(config.ip, "10.1.2.3");
        assert_eq!(config.port, 6661);
        assert_eq!(config.bed_count, 150);
        assert!(!config.send_alarms);
    }

    #[test]
    fn test_empty_value_means_unset() {
        let config = SimulatorConfig::from_lookup(lookup_from(&[("PORT", ""), ("IP", "")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ip, DEFAULT_IP);
    }

    #[test]
    fn test_malformed_port_is_rejected() {
        let err = SimulatorConfig::from_lookup(lookup_from(&[("PORT", "ninety")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "PORT", .. }));
    }

    #[test]
    fn test_malformed_bed_count_is_rejected() {
        let err = SimulatorConfig::from_lookup(lookup_from(&[("BED_COUNT", "-3")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "BED_COUNT", .. }));
    }

    #[test]
    fn test_malformed_alarm_flag_is_rejected() {
        let err = SimulatorConfig::from_lookup(lookup_from(&[("SEND_ALARMS", "yes")])).unwrap_err();
        assert!(err.to_string().contains("SEND_ALARMS"));
    }

    #[test]
    fn test_parse_bool_spellings() {
        for v in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("tRuE"), None);
    }

    #[test]
    fn test_display_summary() {
        let summary = SimulatorConfig::default().to_string();
        assert_eq!(summary, "127.0.0.1:9899, 20 beds, send_alarms = true");
    }
}
