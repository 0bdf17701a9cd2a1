//! Error types of the broker client

use rumqttc::ConnectReturnCode;
use thiserror::Error;

/// Reason a broker refused the CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("unacceptable protocol version")]
    ProtocolVersion,

    #[error("identifier rejected")]
    IdentifierRejected,

    #[error("server unavailable")]
    ServerUnavailable,

    #[error("bad user name or password")]
    BadCredentials,

    #[error("not authorised")]
    NotAuthorized,
}

impl RejectReason {
    /// `None` for [`ConnectReturnCode::Success`]
    pub fn from_code(code: ConnectReturnCode) -> Option<Self> {
        match code {
            ConnectReturnCode::Success => None,
            ConnectReturnCode::RefusedProtocolVersion => Some(RejectReason::ProtocolVersion),
            ConnectReturnCode::BadClientId => Some(RejectReason::IdentifierRejected),
            ConnectReturnCode::ServiceUnavailable => Some(RejectReason::ServerUnavailable),
            ConnectReturnCode::BadUserNamePassword => Some(RejectReason::BadCredentials),
            ConnectReturnCode::NotAuthorized => Some(RejectReason::NotAuthorized),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    /// Broker refused the session at protocol level, never retried
    #[error("Connection refused: {0}")]
    Rejected(RejectReason),

    /// First connection attempt failed at transport level
    #[error("Error connecting to {broker}: {reason}")]
    InitialConnect { broker: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Client request failed: {0}")]
    Client(String),
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(e: rumqttc::ClientError) -> Self {
        MqttError::Client(e.to_string())
    }
}
