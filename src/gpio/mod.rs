//! GPIO subsystem
//!
//! Capability-abstracted access to the digital pins of the board:
//!
//! 1. [`pin_map`] - Static header table, logical pin id → [`PinDescriptor`]
//! 2. [`GpioDriver`] - Backend trait (`configure_direction`, `write`, `read`)
//! 3. [`SharedDriver`] - Serialised driver access shared by the bridge tasks
//!
//! # Backends
//!
//! ```text
//! DriverFamily::Sysfs ──► SysfsDriver  (/sys/class/gpio, Orange Pi boards)
//! DriverFamily::Rppal ──► RppalDriver  (Raspberry Pi, rppal crate)
//! DriverFamily::Mock  ──► MockDriver   (in-memory, dry runs and tests)
//! ```
//!
//! The backend is chosen once at startup through [`create_driver`]. A backend that
//! is not usable on the running system fails right there with
//! [`GpioError::BackendUnavailable`]; nothing downstream has to probe again.

pub mod mock;
pub mod pin_map;
pub mod rppal_driver;
pub mod sysfs;

pub use mock::{DriverCall, MockDriver};
pub use pin_map::{BoardLayout, PinDescriptor, PinMapError, PinMapper, PinNumbering};
pub use rppal_driver::RppalDriver;
pub use sysfs::SysfsDriver;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Not;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};

/// Logic level of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Payload used on the wire: `"1"` for High, `"0"` for Low
    pub fn as_payload(self) -> &'static str {
        match self {
            Level::High => "1",
            Level::Low => "0",
        }
    }

    /// Any non-zero integer is High
    pub fn from_value(value: i64) -> Self {
        if value == 0 {
            Level::Low
        } else {
            Level::High
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Self::Output {
        match self {
            Level::High => Level::Low,
            Level::Low => Level::High,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::High => write!(f, "High"),
            Level::Low => write!(f, "Low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Driver families selectable in the `[gpio]` section
///
/// `opi_gpio` and `opi_pya20` are accepted as aliases for the sysfs backend so
/// existing Orange Pi installations keep their module setting.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    #[default]
    #[serde(alias = "opi_gpio", alias = "opi_pya20")]
    Sysfs,
    #[serde(alias = "rpi", alias = "rpi_gpio")]
    Rppal,
    Mock,
}

impl fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverFamily::Sysfs => write!(f, "sysfs"),
            DriverFamily::Rppal => write!(f, "rppal"),
            DriverFamily::Mock => write!(f, "mock"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    /// Selected backend cannot be used on this system (fatal at startup)
    #[error("GPIO backend '{family}' unavailable: {reason}")]
    BackendUnavailable { family: DriverFamily, reason: String },

    #[error("I/O error on {pin}: {source}")]
    Io {
        pin: PinDescriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend error on {pin}: {reason}")]
    Backend { pin: PinDescriptor, reason: String },

    #[error("Unexpected value '{value}' read from {pin}")]
    InvalidValue { pin: PinDescriptor, value: String },
}

/// Backend interface over one family of GPIO hardware
///
/// Implementations are driven from behind [`SharedDriver`], so they never see
/// concurrent calls.
pub trait GpioDriver: Send + 'static {
    fn family(&self) -> DriverFamily;

    fn configure_direction(
        &mut self,
        pin: PinDescriptor,
        direction: Direction,
    ) -> Result<(), GpioError>;

    fn write(&mut self, pin: PinDescriptor, level: Level) -> Result<(), GpioError>;

    fn read(&mut self, pin: PinDescriptor) -> Result<Level, GpioError>;

    /// Gives claimed lines back to the system
    fn release(&mut self) {}
}

/// Backend-specific startup options
#[derive(Clone, Debug, Default)]
pub struct DriverOptions {
    pub sysfs_root: Option<PathBuf>,
}

/// Capability-checked factory for the configured backend
pub fn create_driver(
    family: DriverFamily,
    options: &DriverOptions,
) -> Result<Box<dyn GpioDriver>, GpioError> {
    info!("Selecting GPIO backend: {}", family);
    let driver: Box<dyn GpioDriver> = match family {
        DriverFamily::Sysfs => {
            let root = options
                .sysfs_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(sysfs::DEFAULT_SYSFS_ROOT));
            Box::new(SysfsDriver::open(root)?)
        }
        DriverFamily::Rppal => Box::new(RppalDriver::open()?),
        DriverFamily::Mock => {
            warn!("Mock GPIO backend selected, no hardware will be touched");
            Box::new(MockDriver::new())
        }
    };
    debug!("GPIO backend {} ready", driver.family());
    Ok(driver)
}

/// Driver handle shared between the command router and the poll task
///
/// One async mutex serialises every call, so a command write (direction + level)
/// never interleaves with a poll read on the same line. Read inversion is applied
/// here, uniformly for all pins.
#[derive(Clone)]
pub struct SharedDriver {
    inner: Arc<Mutex<Box<dyn GpioDriver>>>,
    invert_readings: bool,
}

impl SharedDriver {
    pub fn new(driver: Box<dyn GpioDriver>, invert_readings: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(driver)),
            invert_readings,
        }
    }

    /// Runs one driver operation on the blocking pool while holding the lock
    ///
    /// Backends do synchronous file and register I/O (sysfs export settles with
    /// short sleeps), which must not stall a runtime worker.
    async fn with_driver<R, F>(&self, pin: PinDescriptor, op: F) -> Result<R, GpioError>
    where
        F: FnOnce(&mut dyn GpioDriver) -> Result<R, GpioError> + Send + 'static,
        R: Send + 'static,
    {
        let mut driver = self.inner.clone().lock_owned().await;
        task::spawn_blocking(move || op(&mut **driver))
            .await
            .map_err(|e| GpioError::Backend {
                pin,
                reason: format!("driver call aborted: {}", e),
            })?
    }

    /// Forces output direction, then sets the level
    pub async fn drive_output(&self, pin: PinDescriptor, level: Level) -> Result<(), GpioError> {
        self.with_driver(pin, move |driver| {
            driver.configure_direction(pin, Direction::Output)?;
            driver.write(pin, level)
        })
        .await
    }

    pub async fn configure_input(&self, pin: PinDescriptor) -> Result<(), GpioError> {
        self.with_driver(pin, move |driver| {
            driver.configure_direction(pin, Direction::Input)
        })
        .await
    }

    /// Reads a pin, honouring the inversion flag
    pub async fn sample(&self, pin: PinDescriptor) -> Result<Level, GpioError> {
        let level = self.with_driver(pin, move |driver| driver.read(pin)).await?;
        Ok(if self.invert_readings { !level } else { level })
    }

    pub async fn release(&self) {
        let mut driver = self.inner.clone().lock_owned().await;
        info!("Releasing GPIO lines ({})", driver.family());
        if let Err(e) = task::spawn_blocking(move || driver.release()).await {
            warn!("Releasing GPIO lines failed: {}", e);
        }
    }
}
