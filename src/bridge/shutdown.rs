//! OS signals that end the bridge

use std::fmt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Signals that trigger a graceful shutdown; the process exits with their number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Interrupt,
    Quit,
    Terminate,
}

impl ShutdownSignal {
    pub fn number(self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 1,
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Quit => 3,
            ShutdownSignal::Terminate => 15,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Terminate => "SIGTERM",
        };
        write!(f, "{} ({})", name, self.number())
    }
}

/// Handlers for TERM, INT, HUP and QUIT, installed before any broker I/O
pub struct SignalListener {
    hangup: Signal,
    interrupt: Signal,
    quit: Signal,
    terminate: Signal,
}

impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next shutdown signal; cancel-safe
    pub async fn recv(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.hangup.recv() => ShutdownSignal::Hangup,
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.quit.recv() => ShutdownSignal::Quit,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };
        info!("Received {}, shutting down", received);
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_is_signal_number() {
        assert_eq!(ShutdownSignal::Terminate.number(), 15);
        assert_eq!(ShutdownSignal::Interrupt.number(), 2);
        assert_eq!(ShutdownSignal::Hangup.to_string(), "SIGHUP (1)");
    }
}
