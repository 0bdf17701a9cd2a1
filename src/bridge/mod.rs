//! Bridge between broker topics and GPIO pins
//!
//! ```text
//! broker ──► inbound queue ──► [router] ──► mapper ──► SharedDriver::drive_output
//!                                 │
//!                              refresh
//!                                 ▼
//! broker ◄── outbound queue ◄── [poller] ◄── SharedDriver::sample (every tick)
//! ```
//!
//! The router and the poller run as separate tokio tasks next to the broker
//! tasks; [`controller::Bridge`] owns all of them.

pub mod controller;
pub mod error;
pub mod poller;
pub mod router;
pub mod shutdown;

pub use controller::{Bridge, Termination};
pub use error::{BridgeError, EXIT_CONFIG, EXIT_CONNECT};
pub use poller::{LastPublished, PinRuntimeState, PollSummary, StatePoller};
pub use router::{Command, CommandRouter, DecodeError, RouteError, TopicRouter};
pub use shutdown::{ShutdownSignal, SignalListener};
