//! Connection state machine of the broker client
//!
//! Pure bookkeeping: broker events go in, the actions the client has to perform
//! come out. [`MqttHandler`](super::mqtt_handler::MqttHandler) feeds it from the
//! rumqttc event loop and executes the actions.
//!
//! ```text
//!                connect              CONNACK ok
//! Disconnected ─────────► Connecting ────────────► Connected
//!      ▲                   │   ▲                      │
//!      │  refused / first  │   │ backoff elapsed      │ network loss
//!      │  transport error  │   │                      ▼
//!      └───────────────────┘   └──────────────── Reconnecting
//!      ▲
//!      └──────── clean disconnect (LWT "0", DISCONNECT) ── Connected
//! ```

use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::{Delivery, TopicClass, TopicLayout};
use super::error::{MqttError, RejectReason};
use super::message_manager::MQTTMessage;

pub const LWT_ONLINE: &str = "1";
pub const LWT_OFFLINE: &str = "0";

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Value the retained LWT record must carry in this state
    pub fn lwt_payload(self) -> &'static str {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => LWT_ONLINE,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => LWT_OFFLINE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    Accepted,
    Rejected(RejectReason),
    TransportFailed(String),
    DisconnectRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Subscribe { filter: String, delivery: Delivery },
    Publish(MQTTMessage),
    /// Wait before the next connection attempt
    Backoff(Duration),
    Disconnect,
    /// Stop the client, the error ends the process
    Abort(MqttError),
}

pub struct ConnectionStateMachine {
    state: ConnectionState,
    layout: TopicLayout,
    broker: String,
    reconnect_delay: Duration,
    ever_connected: bool,
}

impl ConnectionStateMachine {
    pub fn new(layout: TopicLayout, broker: String, reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            layout,
            broker,
            reconnect_delay,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        use ConnectionState::*;

        let previous = self.state;
        let actions = match (self.state, event) {
            (Disconnected | Reconnecting, LinkEvent::ConnectRequested) => {
                debug!("Connecting to {}...", self.broker);
                self.state = Connecting;
                Vec::new()
            }
            (Connecting | Connected, LinkEvent::ConnectRequested) => Vec::new(),

            (Disconnected, LinkEvent::Accepted) => {
                warn!("CONNACK received while disconnected, ignoring");
                Vec::new()
            }
            (_, LinkEvent::Accepted) => {
                info!("Connected to {}", self.broker);
                self.state = Connected;
                self.ever_connected = true;
                self.session_setup()
            }

            (_, LinkEvent::Rejected(reason)) => {
                warn!("Connection refused - {}", reason);
                self.state = Disconnected;
                vec![LinkAction::Abort(MqttError::Rejected(reason))]
            }

            (Connecting, LinkEvent::TransportFailed(reason)) if !self.ever_connected => {
                self.state = Disconnected;
                vec![LinkAction::Abort(MqttError::InitialConnect {
                    broker: self.broker.clone(),
                    reason,
                })]
            }
            (Connecting | Connected | Reconnecting, LinkEvent::TransportFailed(reason)) => {
                info!(
                    "Broker connection lost ({}). Retrying in {}s...",
                    reason,
                    self.reconnect_delay.as_secs_f64()
                );
                self.state = Reconnecting;
                vec![LinkAction::Backoff(self.reconnect_delay)]
            }
            (Disconnected, LinkEvent::TransportFailed(reason)) => {
                debug!("Transport error while disconnected: {}", reason);
                vec![LinkAction::Backoff(self.reconnect_delay)]
            }

            (Connected, LinkEvent::DisconnectRequested) => {
                info!("Disconnecting from broker...");
                self.state = Disconnected;
                vec![
                    LinkAction::Publish(self.lwt_message(LWT_OFFLINE)),
                    LinkAction::Disconnect,
                ]
            }
            (_, LinkEvent::DisconnectRequested) => {
                self.state = Disconnected;
                Vec::new()
            }
        };

        if previous != self.state {
            debug!("Connection state {:?} -> {:?}", previous, self.state);
        }
        actions
    }

    /// Subscriptions and LWT announcement after a successful CONNACK
    fn session_setup(&self) -> Vec<LinkAction> {
        let mut actions = vec![LinkAction::Subscribe {
            filter: self.layout.command_filter(),
            delivery: self.layout.delivery(TopicClass::Command),
        }];
        if let Some(refresh) = self.layout.refresh_topic() {
            actions.push(LinkAction::Subscribe {
                filter: refresh.to_string(),
                delivery: self.layout.delivery(TopicClass::Refresh),
            });
        }
        actions.push(LinkAction::Publish(self.lwt_message(LWT_ONLINE)));
        actions
    }

    pub fn lwt_message(&self, payload: &str) -> MQTTMessage {
        MQTTMessage::with_delivery(
            self.layout.lwt_topic().to_string(),
            payload.to_string(),
            self.layout.delivery(TopicClass::Lwt),
        )
    }
}
