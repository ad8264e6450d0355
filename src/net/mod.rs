//! Networking: duplex connection to the remote audio service

pub mod backoff;
pub mod client;
pub mod connection;
pub(crate) mod handler;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod memory;

pub use backoff::ReconnectPolicy;
pub use client::{AudioClient, AudioStatusEvent, ClientError, WriteOutcome};
pub use connection::{Handshake, HandshakeError, HandshakeState};
pub use protocol::{Message, PlayerStatus};
pub use transport::{Connector, WebSocketConnector};
