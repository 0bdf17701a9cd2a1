//! # MQTT side of the bridge
//!
//! One broker session per process, driven by rumqttc's async event loop.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - connection settings, per-class QoS/retain, topic layout
//! ├── connection.rs       - connection state machine and LWT bookkeeping
//! ├── error.rs            - broker rejections and client errors
//! ├── message_manager.rs  - message representation and channel ends
//! ├── mqtt_handler.rs     - event loop task, outbound publisher, shutdown flush
//! └── tls.rs              - rustls transport (CA file, insecure, protocol pin)
//! ```
//!
//! ## Channels
//!
//! ```text
//!            received_msg                       distribution_msg
//! broker ──► [event loop task] ──► router      poller ──► [publisher task] ──► broker
//! ```
//!
//! The event loop task owns the [`connection::ConnectionStateMachine`]; every state
//! change is mirrored on a `watch` channel and in the retained LWT record.

pub mod config;
pub mod connection;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod tls;

pub use config::{Delivery, MqttConfig, QosLevel, TopicClass, TopicLayout};
pub use connection::ConnectionState;
pub use error::{MqttError, RejectReason};
pub use message_manager::{MQTTMessage, MsgManager};
pub use mqtt_handler::{MqttHandle, MqttHandler};
