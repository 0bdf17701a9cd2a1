use thiserror::Error;

use crate::config::ConfigError;
use crate::gpio::GpioError;
use crate::mqtt::MqttError;

/// Process status for configuration problems (`EX_CONFIG`)
pub const EXIT_CONFIG: i32 = 78;
/// Process status when the first broker connection fails
pub const EXIT_CONNECT: i32 = 2;
/// Anything else that ends the bridge unexpectedly
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("GPIO: {0}")]
    Gpio(#[from] GpioError),

    #[error("MQTT: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Signal handling unavailable: {0}")]
    Signals(#[source] std::io::Error),
}

impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => EXIT_CONFIG,
            BridgeError::Gpio(GpioError::BackendUnavailable { .. }) => EXIT_CONFIG,
            BridgeError::Gpio(_) => EXIT_FAILURE,
            BridgeError::Mqtt(MqttError::Rejected(_)) => EXIT_CONFIG,
            BridgeError::Mqtt(MqttError::Tls(_)) => EXIT_CONFIG,
            BridgeError::Mqtt(MqttError::InitialConnect { .. }) => EXIT_CONNECT,
            BridgeError::Mqtt(MqttError::Client(_)) => EXIT_FAILURE,
            BridgeError::Signals(_) => EXIT_FAILURE,
        }
    }
}
