//! Inbound topic decoding and pin writes

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level as LogLevel};

use crate::gpio::{GpioError, Level, PinMapError, PinMapper, SharedDriver};
use crate::mqtt::{MQTTMessage, TopicLayout};

/// Decoded inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    Write { pin: u32, level: Level },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("not a command topic: {0}")]
    NotACommandTopic(String),

    #[error("invalid pin id '{0}'")]
    InvalidPinId(String),

    #[error("invalid payload '{0}', expected an integer")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Mapping(#[from] PinMapError),

    #[error(transparent)]
    Gpio(#[from] GpioError),
}

impl RouteError {
    /// Level a dropped message is logged at
    pub fn log_level(&self) -> LogLevel {
        match self {
            // stray topics can arrive through retained or overlapping subscriptions
            RouteError::Decode(DecodeError::NotACommandTopic(_)) => LogLevel::DEBUG,
            RouteError::Decode(_) | RouteError::Mapping(_) | RouteError::Gpio(_) => LogLevel::ERROR,
        }
    }
}

/// Maps topics to commands, no I/O
#[derive(Debug, Clone)]
pub struct TopicRouter {
    command_prefix: String,
    refresh_topic: Option<String>,
}

impl TopicRouter {
    pub fn new(layout: &TopicLayout) -> Self {
        Self {
            command_prefix: layout.command_prefix(),
            refresh_topic: layout.refresh_topic().map(str::to_string),
        }
    }

    pub fn decode(&self, msg: &MQTTMessage) -> Result<Command, DecodeError> {
        let topic = msg.topic();
        if self.refresh_topic.as_deref() == Some(topic) {
            return Ok(Command::Refresh);
        }

        let pin_segment = topic
            .strip_prefix(&self.command_prefix)
            .ok_or_else(|| DecodeError::NotACommandTopic(topic.to_string()))?;
        let pin = pin_segment
            .parse::<u32>()
            .map_err(|_| DecodeError::InvalidPinId(pin_segment.to_string()))?;

        let payload = msg.content().trim();
        let value = payload
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidPayload(payload.to_string()))?;

        Ok(Command::Write {
            pin,
            level: Level::from_value(value),
        })
    }
}

/// Executes decoded commands against the GPIO driver
pub struct CommandRouter {
    router: TopicRouter,
    mapper: Arc<PinMapper>,
    driver: SharedDriver,
    refresh_tx: mpsc::Sender<()>,
    monitored: HashSet<u32>,
}

impl CommandRouter {
    pub fn new(
        router: TopicRouter,
        mapper: Arc<PinMapper>,
        driver: SharedDriver,
        refresh_tx: mpsc::Sender<()>,
        monitored: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            router,
            mapper,
            driver,
            refresh_tx,
            monitored: monitored.into_iter().collect(),
        }
    }

    pub async fn dispatch(&self, msg: &MQTTMessage) -> Result<Command, RouteError> {
        let command = self.router.decode(msg)?;
        match command {
            Command::Refresh => {
                debug!("Refreshing the state of all monitored pins...");
                match self.refresh_tx.try_send(()) {
                    // a pending request covers this one
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => warn!("Poller gone, refresh ignored"),
                }
            }
            Command::Write { pin, level } => {
                let descriptor = self.mapper.resolve(pin)?;
                if self.monitored.contains(&pin) {
                    warn!("Pin {} is monitored, switching it to output", pin);
                }
                debug!("Incoming message for pin {} -> {}", pin, level);
                self.driver.drive_output(descriptor, level).await?;
                info!("Pin {} ({}) set {}", pin, descriptor, level);
            }
        }
        Ok(command)
    }

    /// Consumes inbound messages in arrival order until shutdown
    pub async fn run(self, mut inbound: mpsc::Receiver<MQTTMessage>, shutdown: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match self.dispatch(&msg).await {
                Ok(_) => {}
                Err(RouteError::Gpio(e)) => error!("GPIO write failed: {}", e),
                Err(e) if e.log_level() == LogLevel::ERROR => {
                    error!("Dropping {} = {:?}: {}", msg.topic(), msg.content(), e)
                }
                Err(e) => debug!("Dropping {}: {}", msg.topic(), e),
            }
        }
        debug!("Command router stopped");
    }
}
