use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// MQTT QoS as written in the config file (`0`, `1` or `2`)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for QosLevel {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => QosLevel::AtMostOnce,
            QoS::AtLeastOnce => QosLevel::AtLeastOnce,
            QoS::ExactlyOnce => QosLevel::ExactlyOnce,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsProtocol {
    #[serde(rename = "tlsv1.2", alias = "tls12")]
    Tls12,
    #[serde(rename = "tlsv1.3", alias = "tls13")]
    Tls13,
}

/// Present `[mqtt.tls]` section switches the transport to TLS
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file with the CA certificate(s) of the broker
    pub ca_cert: Option<PathBuf>,
    /// Skip certificate verification
    pub insecure: bool,
    pub protocol: Option<TlsProtocol>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Generated as `<app>_<pid>` when empty, which forces a clean session
    pub client_id: Option<String>,
    /// Base topic, commands arrive on `<topic>/in/<pin>`
    pub topic: String,
    pub qos: QosLevel,
    pub retain: bool,
    pub clean_session: bool,
    /// Defaults to `<topic>/lwt`
    pub lwt: Option<String>,

    pub command_qos: Option<QosLevel>,
    pub state_qos: Option<QosLevel>,
    pub state_retain: Option<bool>,
    pub lwt_qos: Option<QosLevel>,

    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,

    pub tls: Option<TlsSettings>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            topic: "gpio".to_string(),
            qos: QosLevel::AtMostOnce,
            retain: false,
            clean_session: true,
            lwt: None,
            command_qos: None,
            state_qos: None,
            state_retain: None,
            lwt_qos: None,
            keep_alive_secs: 60,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            shutdown_timeout_secs: 3,
            tls: None,
        }
    }
}

impl MqttConfig {
    /// Client id and clean-session flag actually used for the connection
    pub fn session_identity(&self, app_name: &str) -> (String, bool) {
        match self.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => (id.to_string(), self.clean_session),
            _ => (format!("{}_{}", app_name, std::process::id()), true),
        }
    }

    pub fn lwt_topic(&self) -> String {
        self.lwt
            .clone()
            .unwrap_or_else(|| format!("{}/lwt", self.topic.trim_end_matches('/')))
    }

    pub fn delivery(&self, class: TopicClass) -> Delivery {
        match class {
            TopicClass::Command => Delivery::new(self.command_qos.unwrap_or(self.qos), false),
            TopicClass::State => Delivery::new(
                self.state_qos.unwrap_or(self.qos),
                self.state_retain.unwrap_or(self.retain),
            ),
            // will and LWT publishes are retained whatever `retain` says
            TopicClass::Lwt => Delivery::new(self.lwt_qos.unwrap_or(self.qos), true),
            TopicClass::Refresh => Delivery::new(QosLevel::AtMostOnce, false),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicClass {
    Command,
    State,
    Lwt,
    Refresh,
}

/// QoS and retain flag for one class of topics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub qos: QosLevel,
    pub retain: bool,
}

impl Delivery {
    pub fn new(qos: QosLevel, retain: bool) -> Self {
        Self { qos, retain }
    }

    pub fn qos(&self) -> QoS {
        self.qos.into()
    }
}

impl Default for Delivery {
    fn default() -> Self {
        Self::new(QosLevel::AtMostOnce, false)
    }
}

/// Every topic the bridge talks on, resolved once from the config
#[derive(Clone, Debug, PartialEq)]
pub struct TopicLayout {
    base: String,
    lwt: String,
    refresh: Option<String>,
    command: Delivery,
    state: Delivery,
    lwt_delivery: Delivery,
    refresh_delivery: Delivery,
}

impl TopicLayout {
    pub fn new(config: &MqttConfig, refresh: Option<String>) -> Self {
        Self {
            base: config.topic.trim_end_matches('/').to_string(),
            lwt: config.lwt_topic(),
            refresh: refresh.filter(|topic| !topic.is_empty()),
            command: config.delivery(TopicClass::Command),
            state: config.delivery(TopicClass::State),
            lwt_delivery: config.delivery(TopicClass::Lwt),
            refresh_delivery: config.delivery(TopicClass::Refresh),
        }
    }

    /// Subscription filter for inbound commands
    pub fn command_filter(&self) -> String {
        format!("{}/in/+", self.base)
    }

    pub fn command_prefix(&self) -> String {
        format!("{}/in/", self.base)
    }

    pub fn state_topic(&self, pin: u32) -> String {
        format!("{}/out/{}", self.base, pin)
    }

    pub fn lwt_topic(&self) -> &str {
        &self.lwt
    }

    pub fn refresh_topic(&self) -> Option<&str> {
        self.refresh.as_deref()
    }

    pub fn delivery(&self, class: TopicClass) -> Delivery {
        match class {
            TopicClass::Command => self.command,
            TopicClass::State => self.state,
            TopicClass::Lwt => self.lwt_delivery,
            TopicClass::Refresh => self.refresh_delivery,
        }
    }
}

impl fmt::Display for TopicLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commands={} states={}/out/<pin> lwt={} refresh={}",
            self.command_filter(),
            self.base,
            self.lwt,
            self.refresh.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_id_forces_clean_session() {
        let config = MqttConfig {
            clean_session: false,
            ..MqttConfig::default()
        };
        let (id, clean) = config.session_identity("gpio-mqtt-bridge");
        assert_eq!(id, format!("gpio-mqtt-bridge_{}", std::process::id()));
        assert!(clean);

        let config = MqttConfig {
            client_id: Some("garden-pi".to_string()),
            clean_session: false,
            ..MqttConfig::default()
        };
        assert_eq!(
            config.session_identity("gpio-mqtt-bridge"),
            ("garden-pi".to_string(), false)
        );
    }

    #[test]
    fn per_class_delivery_falls_back_to_globals() {
        let config = MqttConfig {
            qos: QosLevel::AtLeastOnce,
            retain: true,
            state_qos: Some(QosLevel::ExactlyOnce),
            ..MqttConfig::default()
        };
        assert_eq!(
            config.delivery(TopicClass::Command),
            Delivery::new(QosLevel::AtLeastOnce, false)
        );
        assert_eq!(
            config.delivery(TopicClass::State),
            Delivery::new(QosLevel::ExactlyOnce, true)
        );
    }

    #[test]
    fn lwt_is_always_retained() {
        let config = MqttConfig {
            retain: false,
            ..MqttConfig::default()
        };
        assert!(config.delivery(TopicClass::Lwt).retain);
    }

    #[test]
    fn topic_layout() {
        let config = MqttConfig {
            topic: "home/opi/".to_string(),
            ..MqttConfig::default()
        };
        let layout = TopicLayout::new(&config, Some("home/opi/refresh".to_string()));
        assert_eq!(layout.command_filter(), "home/opi/in/+");
        assert_eq!(layout.state_topic(12), "home/opi/out/12");
        assert_eq!(layout.lwt_topic(), "home/opi/lwt");
        assert_eq!(layout.refresh_topic(), Some("home/opi/refresh"));

        let layout = TopicLayout::new(&config, Some(String::new()));
        assert_eq!(layout.refresh_topic(), None);
    }

    #[test]
    fn qos_rejects_out_of_range() {
        assert!(QosLevel::try_from(3).is_err());
        assert_eq!(QosLevel::try_from(2), Ok(QosLevel::ExactlyOnce));
    }
}
