//! Raspberry Pi backend on top of `rppal`

use rppal::gpio::{Gpio, IoPin, Mode};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{Direction, DriverFamily, GpioDriver, GpioError, Level, PinDescriptor};

pub struct RppalDriver {
    gpio: Gpio,
    // Pins are claimed lazily, rppal resets them when dropped
    pins: HashMap<u32, IoPin>,
}

impl RppalDriver {
    pub fn open() -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::BackendUnavailable {
            family: DriverFamily::Rppal,
            reason: e.to_string(),
        })?;
        info!("rppal GPIO interface opened");
        Ok(Self {
            gpio,
            pins: HashMap::new(),
        })
    }

    fn claim(&mut self, pin: PinDescriptor, mode: Mode) -> Result<&mut IoPin, GpioError> {
        if !self.pins.contains_key(&pin.line()) {
            let bcm = u8::try_from(pin.line()).map_err(|_| GpioError::Backend {
                pin,
                reason: "line number out of range".to_string(),
            })?;
            let io_pin = self
                .gpio
                .get(bcm)
                .map_err(|e| GpioError::Backend {
                    pin,
                    reason: e.to_string(),
                })?
                .into_io(mode);
            debug!("Claimed {} as {:?}", pin, mode);
            self.pins.insert(pin.line(), io_pin);
        }
        self.pins
            .get_mut(&pin.line())
            .ok_or_else(|| GpioError::Backend {
                pin,
                reason: "pin vanished after claim".to_string(),
            })
    }
}

fn to_rppal(level: Level) -> rppal::gpio::Level {
    match level {
        Level::High => rppal::gpio::Level::High,
        Level::Low => rppal::gpio::Level::Low,
    }
}

fn from_rppal(level: rppal::gpio::Level) -> Level {
    match level {
        rppal::gpio::Level::High => Level::High,
        rppal::gpio::Level::Low => Level::Low,
    }
}

impl GpioDriver for RppalDriver {
    fn family(&self) -> DriverFamily {
        DriverFamily::Rppal
    }

    fn configure_direction(
        &mut self,
        pin: PinDescriptor,
        direction: Direction,
    ) -> Result<(), GpioError> {
        let mode = match direction {
            Direction::Input => Mode::Input,
            Direction::Output => Mode::Output,
        };
        self.claim(pin, mode)?.set_mode(mode);
        Ok(())
    }

    fn write(&mut self, pin: PinDescriptor, level: Level) -> Result<(), GpioError> {
        self.claim(pin, Mode::Output)?.write(to_rppal(level));
        Ok(())
    }

    fn read(&mut self, pin: PinDescriptor) -> Result<Level, GpioError> {
        Ok(from_rppal(self.claim(pin, Mode::Input)?.read()))
    }

    fn release(&mut self) {
        self.pins.clear();
    }
}
