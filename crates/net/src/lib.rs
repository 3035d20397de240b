//! pbtc-net: connection manager and peers.
//!
//! Provides:
//! - [`Manager`]: dial loop, inbound listeners, peer lifecycle
//! - [`Peer`]: one live connection with its handshake and read/write loops
//! - [`wire`]: async framing over the `bitcoin` codec

pub mod manager;
pub mod peer;
pub mod wire;

pub use manager::{Manager, ManagerConfig};
pub use peer::{Peer, PeerConfig};
pub use wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connected to self")]
    SelfConnect,
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    #[error("peer has no connection")]
    NotConnected,
}
