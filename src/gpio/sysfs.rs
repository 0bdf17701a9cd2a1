//! Linux sysfs GPIO backend (`/sys/class/gpio`)
//!
//! Covers the Orange Pi boards: every Allwinner line is exported on first use,
//! direction and value are plain text files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Direction, DriverFamily, GpioDriver, GpioError, Level, PinDescriptor};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

// udev needs a moment to fix permissions on freshly exported lines
const EXPORT_SETTLE_ATTEMPTS: u32 = 10;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct SysfsDriver {
    root: PathBuf,
    exported: HashSet<u32>,
}

impl SysfsDriver {
    /// Opens the sysfs GPIO class directory
    ///
    /// Fails with [`GpioError::BackendUnavailable`] if the directory or its
    /// `export` file is missing (kernel without `CONFIG_GPIO_SYSFS`, container, ...).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, GpioError> {
        let root = root.into();
        if !root.join("export").exists() {
            return Err(GpioError::BackendUnavailable {
                family: DriverFamily::Sysfs,
                reason: format!("{} has no export interface", root.display()),
            });
        }
        info!("Using sysfs GPIO interface at {}", root.display());
        Ok(Self {
            root,
            exported: HashSet::new(),
        })
    }

    fn line_dir(&self, pin: PinDescriptor) -> PathBuf {
        self.root.join(format!("gpio{}", pin.line()))
    }

    fn ensure_exported(&mut self, pin: PinDescriptor) -> Result<PathBuf, GpioError> {
        let dir = self.line_dir(pin);
        if self.exported.contains(&pin.line()) {
            return Ok(dir);
        }

        if !dir.exists() {
            debug!("Exporting {}", pin);
            write_attr(pin, &self.root.join("export"), &pin.line().to_string())?;
            wait_for(&dir.join("direction"));
        }
        self.exported.insert(pin.line());
        Ok(dir)
    }
}

fn write_attr(pin: PinDescriptor, path: &Path, value: &str) -> Result<(), GpioError> {
    fs::write(path, value).map_err(|source| GpioError::Io { pin, source })
}

fn wait_for(path: &Path) {
    for _ in 0..EXPORT_SETTLE_ATTEMPTS {
        if path.exists() {
            return;
        }
        thread::sleep(EXPORT_SETTLE_DELAY);
    }
}

impl GpioDriver for SysfsDriver {
    fn family(&self) -> DriverFamily {
        DriverFamily::Sysfs
    }

    fn configure_direction(
        &mut self,
        pin: PinDescriptor,
        direction: Direction,
    ) -> Result<(), GpioError> {
        let dir = self.ensure_exported(pin)?;
        let value = match direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        write_attr(pin, &dir.join("direction"), value)
    }

    fn write(&mut self, pin: PinDescriptor, level: Level) -> Result<(), GpioError> {
        let dir = self.ensure_exported(pin)?;
        write_attr(pin, &dir.join("value"), level.as_payload())
    }

    fn read(&mut self, pin: PinDescriptor) -> Result<Level, GpioError> {
        let dir = self.ensure_exported(pin)?;
        let raw =
            fs::read_to_string(dir.join("value")).map_err(|source| GpioError::Io { pin, source })?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(GpioError::InvalidValue {
                pin,
                value: other.to_string(),
            }),
        }
    }

    fn release(&mut self) {
        let unexport = self.root.join("unexport");
        for line in self.exported.drain() {
            if let Err(e) = fs::write(&unexport, line.to_string()) {
                warn!("Failed to unexport line {}: {}", line, e);
            }
        }
    }
}
