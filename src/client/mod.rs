//! Client-side building blocks: the terminal transport, the reconnection
//! controller it shares with the metrics client, and the metrics client's
//! degraded polling mode.

pub mod metrics;
mod reconnect;
mod transport;

pub use reconnect::{CloseKind, ReconnectController, ReconnectDecision, ReconnectPolicy};
pub use transport::{TerminalEndpoint, TerminalEvent, TerminalTransport, TransportError};
