use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::gpio::{BoardLayout, DriverFamily, DriverOptions, PinMapper, PinNumbering};
use crate::mqtt::config::MqttConfig;

pub const APP_NAME: &str = "gpio-mqtt-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No config path given and no config directory available")]
    NoConfigDir,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Additionally append log lines to this file
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct GpioConfig {
    pub family: DriverFamily,
    /// Defaults to the layout matching the backend family
    pub board: Option<BoardLayout>,
    pub numbering: PinNumbering,
    /// Override for the sysfs backend, mostly for tests
    pub sysfs_root: Option<PathBuf>,
}

impl GpioConfig {
    pub fn layout(&self) -> BoardLayout {
        self.board
            .unwrap_or_else(|| BoardLayout::default_for(self.family))
    }

    pub fn pin_mapper(&self) -> PinMapper {
        PinMapper::new(self.layout(), self.numbering)
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            sysfs_root: self.sysfs_root.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Logical pin ids whose level is published on change
    pub pins: Vec<u32>,
    pub invert_readings: bool,
    /// Seconds between two poll passes, fractions allowed
    pub poll_interval: f64,
    /// Messages on this topic trigger an immediate poll pass
    pub refresh_topic: Option<String>,
    /// Switch monitored pins to input before the first read
    pub configure_input: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pins: Vec::new(),
            invert_readings: false,
            poll_interval: 0.1,
            refresh_topic: None,
            configure_input: true,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    pub gpio: GpioConfig,
    pub monitor: MonitorConfig,
}

impl fmt::Display for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "broker {}:{}, topic {}, gpio {} ({}, {:?}), {} monitored pin(s) every {}s",
            self.mqtt.host,
            self.mqtt.port,
            self.mqtt.topic,
            self.gpio.family,
            self.gpio.layout(),
            self.gpio.numbering,
            self.monitor.pins.len(),
            self.monitor.poll_interval
        )
    }
}

impl BridgeConfig {
    /// `$XDG_CONFIG_HOME/gpio-mqtt-bridge/config.toml` or the platform equivalent
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(APP_NAME);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Loads and validates the config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content)?;
        info!("Configuration loaded: {}", config);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must not be 0".into()));
        }
        if mqtt.topic.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic must not be empty".into()));
        }
        check_topic("mqtt.topic", &mqtt.topic)?;
        if let Some(lwt) = &mqtt.lwt {
            check_topic("mqtt.lwt", lwt)?;
        }
        if let Some(refresh) = &self.monitor.refresh_topic {
            check_topic("monitor.refresh_topic", refresh)?;
        }

        let has_user = mqtt.username.as_deref().is_some_and(|u| !u.is_empty());
        if mqtt.password.is_some() && !has_user {
            return Err(ConfigError::Invalid(
                "mqtt.password is set without mqtt.username".into(),
            ));
        }

        if let Some(tls) = &mqtt.tls {
            if tls.insecure && tls.ca_cert.is_some() {
                return Err(ConfigError::Invalid(
                    "mqtt.tls: ca_cert and insecure are mutually exclusive".into(),
                ));
            }
        }

        if !(self.monitor.poll_interval.is_finite() && self.monitor.poll_interval > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "monitor.poll_interval must be a positive number of seconds, got {}",
                self.monitor.poll_interval
            )));
        }

        let mapper = self.gpio.pin_mapper();
        for pin in &self.monitor.pins {
            mapper
                .resolve(*pin)
                .map_err(|e| ConfigError::Invalid(format!("monitor.pins: {}", e)))?;
        }
        Ok(())
    }
}

fn check_topic(key: &str, topic: &str) -> Result<(), ConfigError> {
    if topic.contains(['+', '#']) {
        return Err(ConfigError::Invalid(format!(
            "{} must not contain wildcards: {}",
            key, topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::QosLevel;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [logging]
        level = "warn"

        [mqtt]
        host = "broker.local"
        username = "opi"
        password = "secret"
        topic = "home/opi"
        qos = 1
        state_retain = true

        [mqtt.tls]
        ca_cert = "/etc/ssl/broker.pem"
        protocol = "tlsv1.2"

        [gpio]
        family = "opi_pya20"
        numbering = "board"

        [monitor]
        pins = [12, 16]
        invert_readings = true
        poll_interval = 0.25
        refresh_topic = "home/opi/refresh"
    "#;

    #[test]
    fn parses_full_file() {
        let config = BridgeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warning);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, QosLevel::AtLeastOnce);
        assert_eq!(config.mqtt.state_retain, Some(true));
        assert!(config.mqtt.tls.is_some());
        assert_eq!(config.gpio.family, DriverFamily::Sysfs);
        assert_eq!(config.gpio.layout(), BoardLayout::OrangePi);
        assert_eq!(config.monitor.pins, vec![12, 16]);
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = BridgeConfig::parse("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(config.monitor.configure_input);
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            "[monitor]\npoll_interval = 0",
            "[monitor]\npoll_interval = -1.5",
            "[mqtt]\ntopic = \"gpio/#\"",
            "[mqtt]\nhost = \"\"",
            "[mqtt]\npassword = \"secret\"",
            "[monitor]\npins = [1]",
            "[mqtt]\nqos = 3",
            "[gpio]\nfamily = \"wiringpi\"",
        ];
        for case in cases {
            assert!(BridgeConfig::parse(case).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn load_reports_missing_file() {
        let err = BridgeConfig::load(Path::new("/nonexistent/bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[mqtt]\nhost = \"10.0.0.2\"\nport = 8883\n").unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
    }

    #[test]
    fn default_path_ends_with_app_dir() {
        if let Ok(path) = BridgeConfig::default_path() {
            assert!(path.ends_with("gpio-mqtt-bridge/config.toml"));
        }
    }
}
