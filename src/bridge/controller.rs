//! Bridge lifecycle with statum typestate
//!
//! ```text
//! Configured ──(start)──► Running ──(stop)──► Stopped
//! ```
//!
//! `start` takes an already connected [`MqttHandler`], so a failed first
//! connection never gets to spawn any task. `stop` tears down in order: router and
//! poller first, then the broker session (LWT "0", DISCONNECT, flush), then the
//! GPIO lines.

use statum::{machine, state};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::BridgeError;
use super::poller::StatePoller;
use super::router::{CommandRouter, TopicRouter};
use super::shutdown::ShutdownSignal;
use crate::config::{BridgeConfig, MonitorConfig};
use crate::gpio::{GpioDriver, PinMapper, SharedDriver};
use crate::mqtt::{MqttError, MqttHandle, MqttHandler, MsgManager, TopicLayout};

const INBOUND_CAPACITY: usize = 100;
const OUTBOUND_CAPACITY: usize = 100;

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Configured,
    Running,
    Stopped,
}

/// Why the running bridge came to an end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Signal(ShutdownSignal),
    Failed(MqttError),
}

impl Termination {
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Signal(signal) => signal.number(),
            Termination::Failed(e) => BridgeError::from(e.clone()).exit_code(),
        }
    }
}

#[machine]
pub struct Bridge<S: BridgeState> {
    mapper: Arc<PinMapper>,
    driver: SharedDriver,
    layout: TopicLayout,
    monitor: MonitorConfig,
    work: CancellationToken,
    broker: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    mqtt: Option<MqttHandle>,
}

impl<S: BridgeState> Bridge<S> {
    pub fn topic_layout(&self) -> &TopicLayout {
        &self.layout
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }
}

impl Bridge<Configured> {
    pub fn create(config: &BridgeConfig, driver: Box<dyn GpioDriver>) -> Self {
        let mapper = Arc::new(config.gpio.pin_mapper());
        info!(
            "Pin table {} ({:?} numbering, {} pins), backend {}",
            mapper.layout(),
            mapper.numbering(),
            mapper.pin_count(),
            driver.family()
        );

        Self::new(
            mapper,
            SharedDriver::new(driver, config.monitor.invert_readings),
            TopicLayout::new(&config.mqtt, config.monitor.refresh_topic.clone()),
            config.monitor.clone(),
            CancellationToken::new(),
            CancellationToken::new(),
            Vec::new(),
            None,
        )
    }

    /// Spawns the broker tasks, the command router and the poller
    pub fn start(mut self, handler: MqttHandler) -> Bridge<Running> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let mqtt = handler.spawn(
            MsgManager {
                received_msg: inbound_tx,
                distribution_msg: outbound_rx,
            },
            self.broker.clone(),
        );

        let router = CommandRouter::new(
            TopicRouter::new(&self.layout),
            self.mapper.clone(),
            self.driver.clone(),
            refresh_tx,
            self.monitor.pins.iter().copied(),
        );
        self.workers
            .push(("router", tokio::spawn(router.run(inbound_rx, self.work.clone()))));

        let poller = StatePoller::new(
            self.monitor.pins.clone(),
            self.mapper.clone(),
            self.driver.clone(),
            self.layout.clone(),
            outbound_tx,
            self.monitor.configure_input,
        );
        self.workers.push((
            "poller",
            tokio::spawn(poller.run(
                self.monitor.poll_interval(),
                refresh_rx,
                self.work.clone(),
            )),
        ));

        self.mqtt = Some(mqtt);
        info!("Bridge running");
        self.transition()
    }
}

impl Bridge<Running> {
    /// Runs until `stop` resolves or the broker session fails for good
    pub async fn run_until<F>(&mut self, stop: F) -> Termination
    where
        F: Future<Output = ShutdownSignal>,
    {
        let Some(mqtt) = self.mqtt.as_mut() else {
            return Termination::Failed(MqttError::Client("broker task missing".to_string()));
        };

        tokio::select! {
            signal = stop => Termination::Signal(signal),
            closed = mqtt.closed() => match closed {
                Err(e) => Termination::Failed(e),
                Ok(()) => Termination::Failed(MqttError::Client(
                    "broker task ended unexpectedly".to_string(),
                )),
            },
        }
    }

    pub async fn stop(mut self) -> Bridge<Stopped> {
        info!("Stopping bridge...");
        self.work.cancel();
        for (name, task) in self.workers.drain(..) {
            if let Err(e) = task.await {
                warn!("{} task failed: {}", name, e);
            }
        }

        self.broker.cancel();
        if let Some(mqtt) = self.mqtt.take() {
            debug!("Broker link {:?} at shutdown", mqtt.state());
            if let Err(e) = mqtt.join().await {
                debug!("Broker session ended with: {}", e);
            }
        }

        self.driver.release().await;
        self.transition()
    }
}

impl Bridge<Stopped> {
    pub fn finish(self, termination: &Termination) -> i32 {
        let code = termination.exit_code();
        match termination {
            Termination::Signal(signal) => info!("Exiting on signal {}", signal.number()),
            Termination::Failed(e) => warn!("Exiting after broker failure: {}", e),
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockDriver;
    use crate::mqtt::RejectReason;

    #[test]
    fn termination_exit_codes() {
        assert_eq!(Termination::Signal(ShutdownSignal::Quit).exit_code(), 3);
        assert_eq!(
            Termination::Failed(MqttError::Rejected(RejectReason::BadCredentials)).exit_code(),
            78
        );
    }

    #[tokio::test]
    async fn stop_releases_gpio() {
        let mut config = BridgeConfig::default();
        config.mqtt.host = "127.0.0.1".to_string();
        config.mqtt.port = 9;
        config.monitor.pins = vec![12];
        config.monitor.poll_interval = 0.01;

        let mock = MockDriver::new();
        let bridge = Bridge::create(&config, Box::new(mock.clone()));
        let handler =
            MqttHandler::new(&config.mqtt, bridge.topic_layout().clone(), "test").unwrap();

        let mut running = bridge.start(handler);
        let termination = running
            .run_until(async { ShutdownSignal::Terminate })
            .await;
        assert_eq!(termination, Termination::Signal(ShutdownSignal::Terminate));

        let stopped = running.stop().await;
        assert!(mock.is_released());
        assert_eq!(stopped.finish(&termination), 15);
    }
}
