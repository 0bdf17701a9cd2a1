use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Outgoing, Packet,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{MqttConfig, TopicClass, TopicLayout};
use super::connection::{ConnectionState, ConnectionStateMachine, LinkAction, LinkEvent, LWT_OFFLINE};
use super::error::{MqttError, RejectReason};
use super::message_manager::{MQTTMessage, MsgManager};
use super::tls::build_transport;

const REQUEST_CAPACITY: usize = 100;
const ERROR_HISTORY: usize = 32;

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    fn touch(&mut self) {
        self.last_activity = Some(chrono::Local::now());
    }

    /// Keeps the most recent errors only
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() >= ERROR_HISTORY {
            let excess = self.error_messages.len() + 1 - ERROR_HISTORY;
            self.error_messages.drain(..excess);
        }
        self.error_messages.push(message);
    }
}

/// Session requests the client queue refused, resent in order once it drains
#[derive(Debug, Default)]
struct RequestBacklog {
    queued: VecDeque<LinkAction>,
}

impl RequestBacklog {
    /// Sends `action` unless earlier requests are still waiting; returns true if held back
    fn submit<F>(&mut self, action: LinkAction, mut send: F) -> bool
    where
        F: FnMut(&LinkAction) -> Result<(), ClientError>,
    {
        if self.queued.is_empty() && send(&action).is_ok() {
            return false;
        }
        self.queued.push_back(action);
        true
    }

    /// Resends held requests until the queue refuses one
    fn flush<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(&LinkAction) -> Result<(), ClientError>,
    {
        let mut sent = 0;
        while let Some(action) = self.queued.front() {
            if send(action).is_err() {
                break;
            }
            self.queued.pop_front();
            sent += 1;
        }
        sent
    }

    fn clear(&mut self) {
        self.queued.clear();
    }

    fn len(&self) -> usize {
        self.queued.len()
    }
}

/// Owns the rumqttc client and event loop of the single broker session
pub struct MqttHandler {
    status: MQTTStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    machine: ConnectionStateMachine,
    backlog: RequestBacklog,
    state_tx: watch::Sender<ConnectionState>,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
}

impl MqttHandler {
    pub fn new(config: &MqttConfig, layout: TopicLayout, app_name: &str) -> Result<Self, MqttError> {
        let (client_id, clean_session) = config.session_identity(app_name);
        let broker = format!("{}:{}", config.host, config.port);

        let mut mqtt_options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(clean_session);

        if let Some(user) = config.username.as_deref().filter(|user| !user.is_empty()) {
            mqtt_options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let will = layout.delivery(TopicClass::Lwt);
        mqtt_options.set_last_will(LastWill::new(
            layout.lwt_topic(),
            LWT_OFFLINE,
            will.qos(),
            will.retain,
        ));

        if let Some(tls) = &config.tls {
            mqtt_options.set_transport(build_transport(tls)?);
        }

        info!(
            "MQTT client {} for {} (clean session: {}, tls: {})",
            client_id,
            broker,
            clean_session,
            config.tls.is_some()
        );
        debug!("Topics: {}", layout);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(MqttHandler {
            status: MQTTStatus::default(),
            client,
            eventloop,
            machine: ConnectionStateMachine::new(layout, broker, config.reconnect_delay()),
            backlog: RequestBacklog::default(),
            state_tx,
            connect_timeout: config.connect_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// First connection attempt, bounded by the connect timeout
    ///
    /// Returns once the broker accepted the session and the subscriptions are queued.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        self.apply(LinkEvent::ConnectRequested)?;

        let timeout = self.connect_timeout;
        let event = match tokio::time::timeout(timeout, self.await_connack()).await {
            Ok(event) => event,
            Err(_) => LinkEvent::TransportFailed(format!(
                "no CONNACK within {}s",
                timeout.as_secs_f64()
            )),
        };
        self.apply(event).map(|_| ())
    }

    async fn await_connack(&mut self) -> LinkEvent {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => return connack_event(ack.code),
                Ok(event) => trace!("Event before CONNACK: {:?}", event),
                Err(e) => return error_event(e),
            }
        }
    }

    /// Spawns the event loop task and the outbound publisher task
    pub fn spawn(self, msg_manager: MsgManager, shutdown: CancellationToken) -> MqttHandle {
        let MsgManager {
            received_msg,
            distribution_msg,
        } = msg_manager;

        let state = self.state_watch();
        let publisher = tokio::spawn(publish_outbound(
            self.client.clone(),
            distribution_msg,
            self.state_watch(),
            shutdown.clone(),
        ));
        let task = tokio::spawn(self.run(received_msg, shutdown));

        MqttHandle {
            state,
            task: Some(task),
            publisher: Some(publisher),
        }
    }

    /// Drives the event loop until shutdown or a fatal broker error
    pub async fn run(
        mut self,
        received_msg: mpsc::Sender<MQTTMessage>,
        shutdown: CancellationToken,
    ) -> Result<(), MqttError> {
        let outcome = self.event_loop(&received_msg, &shutdown).await;
        if outcome.is_ok() {
            self.disconnect().await;
        }

        info!(
            "MQTT session closed: {} received, {} sent, {} errors, last activity {}",
            self.status.messages_received,
            self.status.messages_sent,
            self.status.error_messages.len(),
            self.status
                .last_activity
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        outcome
    }

    async fn event_loop(
        &mut self,
        received_msg: &mpsc::Sender<MQTTMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), MqttError> {
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                polled = self.eventloop.poll() => polled,
            };
            self.flush_backlog();

            let event = match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.status.messages_received += 1;
                    self.status.touch();
                    let msg = MQTTMessage::from_publish(&publish);
                    debug!("Received {}", msg);
                    if received_msg.send(msg).await.is_err() {
                        warn!("Inbound queue closed, dropping message");
                    }
                    continue;
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => connack_event(ack.code),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    LinkEvent::TransportFailed("broker closed the session".to_string())
                }
                Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                    self.status.messages_sent += 1;
                    self.status.touch();
                    continue;
                }
                Ok(event) => {
                    trace!("{:?}", event);
                    continue;
                }
                Err(e) => error_event(e),
            };

            if let Some(delay) = self.apply(event)? {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                self.apply(LinkEvent::ConnectRequested)?;
            }
        }
    }

    /// Publishes LWT "0", sends DISCONNECT and flushes within the shutdown timeout
    async fn disconnect(&mut self) {
        let was_connected = self.machine.state() == ConnectionState::Connected;
        if let Err(e) = self.apply(LinkEvent::DisconnectRequested) {
            warn!("Disconnect failed: {}", e);
            return;
        }
        if !was_connected {
            debug!("Not connected, nothing to flush");
            return;
        }

        let eventloop = &mut self.eventloop;
        let backlog = &mut self.backlog;
        let client = &self.client;
        let flush = async {
            loop {
                let polled = eventloop.poll().await;
                backlog.flush(|action| send_request(client, action));
                match polled {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(event) => trace!("Flushing: {:?}", event),
                    Err(e) => {
                        debug!("Event loop closed while flushing: {}", e);
                        break;
                    }
                }
            }
        };
        match tokio::time::timeout(self.shutdown_timeout, flush).await {
            Ok(()) => info!("Disconnected from broker"),
            Err(_) => warn!(
                "Broker flush did not finish within {}s",
                self.shutdown_timeout.as_secs_f64()
            ),
        }
    }

    /// Feeds one event into the state machine and executes the resulting actions
    ///
    /// Returns the backoff to wait before the next attempt, if any.
    fn apply(&mut self, event: LinkEvent) -> Result<Option<Duration>, MqttError> {
        match &event {
            // requests held for the previous session are superseded by the new setup
            LinkEvent::Accepted => self.backlog.clear(),
            LinkEvent::TransportFailed(reason) => self.status.record_error(reason.clone()),
            _ => {}
        }
        let actions = self.machine.handle(event);
        let state = self.machine.state();
        if self.status.connection_state != state {
            self.status.connection_state = state;
            self.state_tx.send_replace(state);
        }

        let mut backoff = None;
        for action in actions {
            match action {
                LinkAction::Backoff(delay) => backoff = Some(delay),
                LinkAction::Abort(e) => {
                    error!("{}", e);
                    self.status.record_error(e.to_string());
                    return Err(e);
                }
                request => {
                    match &request {
                        LinkAction::Subscribe { filter, delivery } => {
                            info!("Subscribing to {} (QoS {})", filter, u8::from(delivery.qos))
                        }
                        LinkAction::Publish(msg) => {
                            debug!("Publishing {} = {}", msg.topic(), msg.content())
                        }
                        _ => debug!("Requesting {:?}", request),
                    }
                    let client = &self.client;
                    if self.backlog.submit(request, |a| send_request(client, a)) {
                        debug!(
                            "Client queue full, {} session request(s) held back",
                            self.backlog.len()
                        );
                    }
                }
            }
        }
        Ok(backoff)
    }

    fn flush_backlog(&mut self) {
        let client = &self.client;
        let sent = self.backlog.flush(|a| send_request(client, a));
        if sent > 0 {
            debug!("Sent {} held session request(s)", sent);
        }
    }
}

/// Queues one client request without waiting for room
fn send_request(client: &AsyncClient, action: &LinkAction) -> Result<(), ClientError> {
    match action {
        LinkAction::Subscribe { filter, delivery } => {
            client.try_subscribe(filter.as_str(), delivery.qos())
        }
        LinkAction::Publish(msg) => {
            let delivery = msg.delivery();
            client.try_publish(
                msg.topic(),
                delivery.qos(),
                delivery.retain,
                msg.content().as_bytes().to_vec(),
            )
        }
        LinkAction::Disconnect => client.try_disconnect(),
        LinkAction::Backoff(_) | LinkAction::Abort(_) => Ok(()),
    }
}

fn connack_event(code: ConnectReturnCode) -> LinkEvent {
    match RejectReason::from_code(code) {
        None => LinkEvent::Accepted,
        Some(reason) => LinkEvent::Rejected(reason),
    }
}

fn error_event(e: ConnectionError) -> LinkEvent {
    match e {
        ConnectionError::ConnectionRefused(code) => connack_event(code),
        other => LinkEvent::TransportFailed(other.to_string()),
    }
}

/// Forwards outbound messages to the client while the session is up
///
/// Messages wait in the outbound channel while the link is down, so the client
/// queue stays free for the subscriptions and LWT of the next session.
async fn publish_outbound(
    client: AsyncClient,
    mut outbound: mpsc::Receiver<MQTTMessage>,
    mut state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) {
    loop {
        let connected = async {
            state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .map(|_| ())
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            ready = connected => if ready.is_err() { break },
        }

        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let delivery = msg.delivery();
        let publish = client.publish(
            msg.topic(),
            delivery.qos(),
            delivery.retain,
            msg.content().as_bytes().to_vec(),
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = publish => match result {
                Ok(()) => debug!("Published {}", msg),
                Err(e) => warn!("Failed to publish {}: {}", msg.topic(), e),
            },
        }
    }
    debug!("Outbound publisher stopped");
}

/// Running broker tasks
pub struct MqttHandle {
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<Result<(), MqttError>>>,
    publisher: Option<JoinHandle<()>>,
}

impl MqttHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits for the event loop task; cancel-safe
    pub async fn closed(&mut self) -> Result<(), MqttError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| MqttError::Client(format!("broker task failed: {}", e)))?
    }

    pub async fn join(mut self) -> Result<(), MqttError> {
        let outcome = self.closed().await;
        if let Some(publisher) = self.publisher.take() {
            if let Err(e) = publisher.await {
                warn!("Publisher task failed: {}", e);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connack_maps_to_rejection() {
        assert_eq!(connack_event(ConnectReturnCode::Success), LinkEvent::Accepted);
        assert_eq!(
            connack_event(ConnectReturnCode::NotAuthorized),
            LinkEvent::Rejected(RejectReason::NotAuthorized)
        );
        assert_eq!(
            error_event(ConnectionError::ConnectionRefused(
                ConnectReturnCode::BadUserNamePassword
            )),
            LinkEvent::Rejected(RejectReason::BadCredentials)
        );
    }

    #[test]
    fn transport_errors_are_retryable_events() {
        let event = error_event(ConnectionError::NetworkTimeout);
        assert!(matches!(event, LinkEvent::TransportFailed(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_initial_connect() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            // nothing listens on the discard port
            port: 9,
            connect_timeout_secs: 2,
            ..MqttConfig::default()
        };
        let layout = TopicLayout::new(&config, None);
        let mut handler = MqttHandler::new(&config, layout, "test").unwrap();

        let result = handler.connect().await;
        assert!(matches!(result, Err(MqttError::InitialConnect { .. })));
        assert_eq!(handler.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_before_connect_closes_quietly() {
        let config = MqttConfig::default();
        let layout = TopicLayout::new(&config, None);
        let handler = MqttHandler::new(&config, layout, "test").unwrap();

        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        let (_outbound_tx, outbound_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let handle = handler.spawn(
            MsgManager {
                received_msg: inbound_tx,
                distribution_msg: outbound_rx,
            },
            shutdown,
        );
        assert_eq!(handle.join().await, Ok(()));
    }

    fn full_queue() -> ClientError {
        ClientError::TryRequest(rumqttc::Request::Disconnect(rumqttc::Disconnect))
    }

    #[test]
    fn backlog_keeps_order_and_stops_at_refusal() {
        let mut backlog = RequestBacklog::default();
        assert!(backlog.submit(LinkAction::Disconnect, |_| Err(full_queue())));
        // held behind the first request even though the queue has room again
        assert!(backlog.submit(LinkAction::Backoff(Duration::from_secs(1)), |_| Ok(())));
        assert_eq!(backlog.len(), 2);

        let mut sent = Vec::new();
        let flushed = backlog.flush(|action| {
            if !sent.is_empty() {
                return Err(full_queue());
            }
            sent.push(action.clone());
            Ok(())
        });
        assert_eq!(flushed, 1);
        assert_eq!(sent, vec![LinkAction::Disconnect]);
        assert_eq!(backlog.len(), 1);

        assert_eq!(backlog.flush(|_| Ok(())), 1);
        assert_eq!(backlog.len(), 0);
    }

    #[test]
    fn reconnect_setup_survives_a_full_client_queue() {
        let config = MqttConfig {
            topic: "opi".to_string(),
            ..MqttConfig::default()
        };
        let layout = TopicLayout::new(&config, Some("opi/refresh".to_string()));
        let mut handler = MqttHandler::new(&config, layout, "test").unwrap();

        handler.apply(LinkEvent::ConnectRequested).unwrap();
        handler.apply(LinkEvent::Accepted).unwrap();
        let delay = handler
            .apply(LinkEvent::TransportFailed("reset by peer".into()))
            .unwrap();
        assert!(delay.is_some());

        // state updates piling up while the link is down
        while handler
            .client
            .try_publish("opi/out/12", rumqttc::QoS::AtMostOnce, false, "1")
            .is_ok()
        {}

        handler.apply(LinkEvent::ConnectRequested).unwrap();
        handler.apply(LinkEvent::Accepted).unwrap();
        assert_eq!(handler.state(), ConnectionState::Connected);

        let held: Vec<LinkAction> = handler.backlog.queued.iter().cloned().collect();
        assert_eq!(held.len(), 3);
        assert!(matches!(
            &held[0],
            LinkAction::Subscribe { filter, .. } if filter == "opi/in/+"
        ));
        assert!(matches!(
            &held[1],
            LinkAction::Subscribe { filter, .. } if filter == "opi/refresh"
        ));
        assert_eq!(
            held[2],
            LinkAction::Publish(handler.machine.lwt_message(super::super::connection::LWT_ONLINE))
        );
        assert_eq!(handler.status.error_messages, vec!["reset by peer".to_string()]);

        assert_eq!(handler.backlog.flush(|_| Ok(())), 3);
    }

    #[tokio::test]
    async fn publisher_waits_for_the_link() {
        let config = MqttConfig::default();
        let layout = TopicLayout::new(&config, None);
        let handler = MqttHandler::new(&config, layout, "test").unwrap();

        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let publisher = tokio::spawn(publish_outbound(
            handler.client.clone(),
            outbound_rx,
            handler.state_watch(),
            shutdown.clone(),
        ));

        outbound_tx
            .send(MQTTMessage::from_topic("opi/out/12".to_string(), "1".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // still queued: the publisher never took it while disconnected
        assert_eq!(outbound_tx.capacity(), 3);

        shutdown.cancel();
        publisher.await.unwrap();
    }

    #[test]
    fn error_history_is_capped() {
        let mut status = MQTTStatus::default();
        for i in 0..40 {
            status.record_error(format!("error {}", i));
        }
        assert_eq!(status.error_messages.len(), ERROR_HISTORY);
        assert_eq!(status.error_messages.first().map(String::as_str), Some("error 8"));
        assert_eq!(status.error_messages.last().map(String::as_str), Some("error 39"));
    }
}
