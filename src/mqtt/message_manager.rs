use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;

use super::config::Delivery;

/// One MQTT message crossing the bridge, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    content: String,
    delivery: Delivery,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(10).collect();
        write!(f, "{} - {} [{}]", self.timestamp, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        Self::with_delivery(topic, content, Delivery::default())
    }

    pub fn with_delivery(topic: String, content: String, delivery: Delivery) -> Self {
        MQTTMessage {
            topic,
            content,
            delivery,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Inbound publish from the broker; payloads that are not UTF-8 are kept lossily
    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        let content = String::from_utf8_lossy(&publish.payload).into_owned();
        let delivery = Delivery::new(publish.qos.into(), publish.retain);
        Self::with_delivery(publish.topic.clone(), content, delivery)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }
}

/// Channel ends between the broker task and the bridge
///
/// `received_msg` carries inbound publishes to the router, `distribution_msg`
/// collects state messages that still have to go out to the broker.
pub struct MsgManager {
    pub received_msg: mpsc::Sender<MQTTMessage>,
    pub distribution_msg: mpsc::Receiver<MQTTMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::QosLevel;

    #[test]
    fn display_truncates_content() {
        let msg = MQTTMessage::from_topic("gpio/in/12".to_string(), "12345678901234".to_string());
        let shown = msg.to_string();
        assert!(shown.contains("gpio/in/12"));
        assert!(shown.contains("[1234567890]"));
        assert!(!shown.contains("1234567890123"));
    }

    #[test]
    fn from_publish_keeps_qos_and_retain() {
        let mut publish = rumqttc::Publish::new("gpio/in/7", rumqttc::QoS::AtLeastOnce, "1");
        publish.retain = true;
        let msg = MQTTMessage::from_publish(&publish);
        assert_eq!(msg.topic(), "gpio/in/7");
        assert_eq!(msg.content(), "1");
        assert_eq!(msg.delivery(), Delivery::new(QosLevel::AtLeastOnce, true));
    }
}
