//! In-memory GPIO backend
//!
//! Used for dry runs (`family = "mock"`) and throughout the tests. Clones share
//! one simulated board, so a test can keep a handle while the driver itself sits
//! boxed inside a [`SharedDriver`](super::SharedDriver).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{Direction, DriverFamily, GpioDriver, GpioError, Level, PinDescriptor};

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Configure(PinDescriptor, Direction),
    Write(PinDescriptor, Level),
    Read(PinDescriptor),
}

#[derive(Debug, Default)]
struct MockBoard {
    directions: HashMap<PinDescriptor, Direction>,
    levels: HashMap<PinDescriptor, Level>,
    failing: HashSet<PinDescriptor>,
    calls: Vec<DriverCall>,
    released: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    board: Arc<Mutex<MockBoard>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn board(&self) -> MutexGuard<'_, MockBoard> {
        // a poisoned board only happens after a panicking test thread
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulates an external signal on a pin
    pub fn set_input(&self, pin: PinDescriptor, level: Level) {
        self.board().levels.insert(pin, level);
    }

    /// Makes every subsequent access to `pin` fail
    pub fn fail_pin(&self, pin: PinDescriptor) {
        self.board().failing.insert(pin);
    }

    pub fn heal_pin(&self, pin: PinDescriptor) {
        self.board().failing.remove(&pin);
    }

    pub fn level(&self, pin: PinDescriptor) -> Option<Level> {
        self.board().levels.get(&pin).copied()
    }

    pub fn direction(&self, pin: PinDescriptor) -> Option<Direction> {
        self.board().directions.get(&pin).copied()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.board().calls.clone()
    }

    /// Recorded calls without the reads issued by polling
    pub fn mutations(&self) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, DriverCall::Read(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.board().calls.clear();
    }

    pub fn is_released(&self) -> bool {
        self.board().released
    }
}

impl GpioDriver for MockDriver {
    fn family(&self) -> DriverFamily {
        DriverFamily::Mock
    }

    fn configure_direction(
        &mut self,
        pin: PinDescriptor,
        direction: Direction,
    ) -> Result<(), GpioError> {
        let mut board = self.board();
        board.calls.push(DriverCall::Configure(pin, direction));
        if board.failing.contains(&pin) {
            return Err(GpioError::Backend {
                pin,
                reason: "simulated fault".to_string(),
            });
        }
        board.directions.insert(pin, direction);
        Ok(())
    }

    fn write(&mut self, pin: PinDescriptor, level: Level) -> Result<(), GpioError> {
        let mut board = self.board();
        board.calls.push(DriverCall::Write(pin, level));
        if board.failing.contains(&pin) {
            return Err(GpioError::Backend {
                pin,
                reason: "simulated fault".to_string(),
            });
        }
        debug!("mock: {} -> {}", pin, level);
        board.levels.insert(pin, level);
        Ok(())
    }

    fn read(&mut self, pin: PinDescriptor) -> Result<Level, GpioError> {
        let mut board = self.board();
        board.calls.push(DriverCall::Read(pin));
        if board.failing.contains(&pin) {
            return Err(GpioError::Backend {
                pin,
                reason: "simulated fault".to_string(),
            });
        }
        Ok(board.levels.get(&pin).copied().unwrap_or(Level::Low))
    }

    fn release(&mut self) {
        self.board().released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIN: PinDescriptor = PinDescriptor::new(68, "PC4");

    #[test]
    fn clones_share_board() {
        let handle = MockDriver::new();
        let mut driver = handle.clone();

        driver.configure_direction(PIN, Direction::Output).unwrap();
        driver.write(PIN, Level::High).unwrap();

        assert_eq!(handle.level(PIN), Some(Level::High));
        assert_eq!(handle.direction(PIN), Some(Direction::Output));
        assert_eq!(handle.calls().len(), 2);
    }

    #[test]
    fn unset_pins_read_low() {
        let mut driver = MockDriver::new();
        assert_eq!(driver.read(PIN).unwrap(), Level::Low);
    }

    #[test]
    fn failing_pin_errors_until_healed() {
        let mut driver = MockDriver::new();
        driver.fail_pin(PIN);
        assert!(driver.read(PIN).is_err());
        assert!(driver.write(PIN, Level::High).is_err());

        driver.heal_pin(PIN);
        assert!(driver.read(PIN).is_ok());
    }
}
