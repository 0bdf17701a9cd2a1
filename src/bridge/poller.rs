//! Poll & change-detection loop for monitored pins

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::gpio::{Level, PinDescriptor, PinMapper, SharedDriver};
use crate::mqtt::{MQTTMessage, TopicClass, TopicLayout};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LastPublished {
    #[default]
    Unknown,
    Known(Level),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRuntimeState {
    pub logical_id: u32,
    pub descriptor: PinDescriptor,
    pub last_published: LastPublished,
}

impl PinRuntimeState {
    fn new(logical_id: u32, descriptor: PinDescriptor) -> Self {
        Self {
            logical_id,
            descriptor,
            last_published: LastPublished::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub published: usize,
    pub unchanged: usize,
    /// Pins skipped this pass because of a driver fault
    pub failed: usize,
    /// Changes not handed off because the outbound queue was full
    pub deferred: usize,
}

/// Owns the per-pin runtime state, only ever touched from the poll task
pub struct StatePoller {
    pins: Vec<u32>,
    mapper: Arc<PinMapper>,
    driver: SharedDriver,
    layout: TopicLayout,
    outbound: mpsc::Sender<MQTTMessage>,
    states: BTreeMap<u32, PinRuntimeState>,
    configure_input: bool,
}

impl StatePoller {
    pub fn new(
        pins: Vec<u32>,
        mapper: Arc<PinMapper>,
        driver: SharedDriver,
        layout: TopicLayout,
        outbound: mpsc::Sender<MQTTMessage>,
        configure_input: bool,
    ) -> Self {
        Self {
            pins,
            mapper,
            driver,
            layout,
            outbound,
            states: BTreeMap::new(),
            configure_input,
        }
    }

    pub fn state(&self, pin: u32) -> Option<&PinRuntimeState> {
        self.states.get(&pin)
    }

    /// Creates the runtime state on first use
    async fn ensure_tracked(&mut self, pin: u32) -> Option<PinDescriptor> {
        if let Some(state) = self.states.get(&pin) {
            return Some(state.descriptor);
        }

        let descriptor = match self.mapper.resolve(pin) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Monitored pin skipped: {}", e);
                return None;
            }
        };
        if self.configure_input {
            if let Err(e) = self.driver.configure_input(descriptor).await {
                warn!("Cannot switch pin {} to input: {}", pin, e);
                return None;
            }
        }

        debug!("Tracking pin {} ({})", pin, descriptor);
        self.states.insert(pin, PinRuntimeState::new(pin, descriptor));
        Some(descriptor)
    }

    /// Reads every monitored pin once and publishes the ones that changed
    pub async fn poll_pass(&mut self) -> PollSummary {
        let mut summary = PollSummary::default();

        for index in 0..self.pins.len() {
            let pin = self.pins[index];
            let Some(descriptor) = self.ensure_tracked(pin).await else {
                summary.failed += 1;
                continue;
            };

            let level = match self.driver.sample(descriptor).await {
                Ok(level) => level,
                Err(e) => {
                    warn!("Reading pin {} failed: {}", pin, e);
                    summary.failed += 1;
                    continue;
                }
            };

            let Some(state) = self.states.get_mut(&pin) else {
                continue;
            };
            if state.last_published == LastPublished::Known(level) {
                summary.unchanged += 1;
                continue;
            }

            let msg = MQTTMessage::with_delivery(
                self.layout.state_topic(pin),
                level.as_payload().to_string(),
                self.layout.delivery(TopicClass::State),
            );
            match self.outbound.try_send(msg) {
                Ok(()) => {
                    info!("Pin {} changed to {}", pin, level);
                    state.last_published = LastPublished::Known(level);
                    summary.published += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue full, pin {} retried next pass", pin);
                    summary.deferred += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Outbound queue closed, pin {} not published", pin);
                    summary.deferred += 1;
                }
            }
        }

        summary
    }

    /// Polls on a fixed interval and on refresh requests until shutdown
    pub async fn run(
        mut self,
        interval: Duration,
        mut refresh: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Monitoring {} pin(s) every {}s",
            self.pins.len(),
            interval.as_secs_f64()
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.poll_pass().await;
                    trace!("Poll pass: {:?}", summary);
                }
                Some(()) = refresh.recv() => {
                    let summary = self.poll_pass().await;
                    debug!("Refresh pass: {:?}", summary);
                }
            }
        }
        debug!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{BoardLayout, DriverCall, MockDriver, PinNumbering};
    use crate::mqtt::{Delivery, MqttConfig, QosLevel};

    struct Fixture {
        mock: MockDriver,
        poller: StatePoller,
        outbound: mpsc::Receiver<MQTTMessage>,
        mapper: Arc<PinMapper>,
    }

    fn fixture(pins: Vec<u32>, invert: bool, capacity: usize) -> Fixture {
        let config = MqttConfig {
            topic: "opi".to_string(),
            state_qos: Some(QosLevel::AtLeastOnce),
            state_retain: Some(true),
            ..MqttConfig::default()
        };
        let mock = MockDriver::new();
        let mapper = Arc::new(PinMapper::new(BoardLayout::OrangePi, PinNumbering::Board));
        let (tx, rx) = mpsc::channel(capacity);
        let poller = StatePoller::new(
            pins,
            mapper.clone(),
            SharedDriver::new(Box::new(mock.clone()), invert),
            TopicLayout::new(&config, None),
            tx,
            true,
        );
        Fixture {
            mock,
            poller,
            outbound: rx,
            mapper,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<MQTTMessage>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push((msg.topic().to_string(), msg.content().to_string()));
        }
        out
    }

    #[tokio::test]
    async fn first_pass_publishes_everything_then_only_changes() {
        let mut f = fixture(vec![12, 16], false, 16);
        let pd14 = f.mapper.resolve(12).unwrap();
        f.mock.set_input(pd14, Level::High);

        let summary = f.poller.poll_pass().await;
        assert_eq!(summary.published, 2);
        assert_eq!(
            drain(&mut f.outbound),
            vec![
                ("opi/out/12".to_string(), "1".to_string()),
                ("opi/out/16".to_string(), "0".to_string()),
            ]
        );

        let summary = f.poller.poll_pass().await;
        assert_eq!(summary.published, 0);
        assert_eq!(summary.unchanged, 2);
        assert!(drain(&mut f.outbound).is_empty());

        f.mock.set_input(pd14, Level::Low);
        f.poller.poll_pass().await;
        assert_eq!(
            drain(&mut f.outbound),
            vec![("opi/out/12".to_string(), "0".to_string())]
        );
        assert_eq!(
            f.poller.state(12).map(|s| s.last_published),
            Some(LastPublished::Known(Level::Low))
        );
    }

    #[tokio::test]
    async fn state_messages_use_state_delivery() {
        let mut f = fixture(vec![12], false, 4);
        f.poller.poll_pass().await;
        let msg = f.outbound.try_recv().unwrap();
        assert_eq!(msg.delivery(), Delivery::new(QosLevel::AtLeastOnce, true));
    }

    #[tokio::test]
    async fn inversion_applies_before_comparison() {
        let mut f = fixture(vec![12], true, 4);
        let pd14 = f.mapper.resolve(12).unwrap();
        f.mock.set_input(pd14, Level::High);

        f.poller.poll_pass().await;
        assert_eq!(
            drain(&mut f.outbound),
            vec![("opi/out/12".to_string(), "0".to_string())]
        );
    }

    #[tokio::test]
    async fn pins_are_switched_to_input_once() {
        let mut f = fixture(vec![12], false, 4);
        let pd14 = f.mapper.resolve(12).unwrap();

        f.poller.poll_pass().await;
        f.poller.poll_pass().await;
        assert_eq!(
            f.mock.mutations(),
            vec![DriverCall::Configure(pd14, crate::gpio::Direction::Input)]
        );
    }

    #[tokio::test]
    async fn read_failure_skips_only_that_pin() {
        let mut f = fixture(vec![12, 16], false, 4);
        let pd14 = f.mapper.resolve(12).unwrap();
        f.poller.poll_pass().await;
        drain(&mut f.outbound);

        f.mock.fail_pin(pd14);
        let pc4 = f.mapper.resolve(16).unwrap();
        f.mock.set_input(pc4, Level::High);

        let summary = f.poller.poll_pass().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(
            drain(&mut f.outbound),
            vec![("opi/out/16".to_string(), "1".to_string())]
        );
        assert_eq!(
            f.poller.state(12).map(|s| s.last_published),
            Some(LastPublished::Known(Level::Low))
        );
    }

    #[tokio::test]
    async fn full_queue_defers_without_losing_the_change() {
        let mut f = fixture(vec![12, 16], false, 1);

        let summary = f.poller.poll_pass().await;
        assert_eq!(summary.published, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(f.poller.state(16).map(|s| s.last_published), Some(LastPublished::Unknown));

        drain(&mut f.outbound);
        let summary = f.poller.poll_pass().await;
        assert_eq!(summary.published, 1);
        assert_eq!(
            drain(&mut f.outbound),
            vec![("opi/out/16".to_string(), "0".to_string())]
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture(vec![12], false, 4);
        let (_refresh_tx, refresh_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.poller.run(
            Duration::from_millis(20),
            refresh_rx,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();
        task.await.unwrap();

        let mut outbound = f.outbound;
        assert_eq!(
            drain(&mut outbound),
            vec![("opi/out/12".to_string(), "0".to_string())]
        );
    }
}
