//! Transport layer for Questline.
//!
//! Participants talk to the server over plain TCP. This crate provides:
//!
//! - [`Connection`]: one bidirectional byte stream, split into a read half
//!   and a write half so a pending receive never blocks a send.
//! - [`Transport`]: something that accepts new connections. [`TcpTransport`]
//!   is the production implementation.
//!
//! Framing is NOT handled here. A call to [`Connection::recv`] returns
//! whatever a single read produced; the protocol layer gives those bytes
//! meaning.

mod connection;
mod error;
mod tcp;

pub use connection::{Connection, MAX_READ_LEN};
pub use error::TransportError;
pub use tcp::TcpTransport;

use std::fmt;
use std::future::Future;

/// Opaque identifier for a connection.
///
/// Assigned when the connection is accepted, long before the participant
/// picks its own id during lobby registration. Mostly useful in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
///
/// The returned future is `Send` so the acceptor can live in its own
/// spawned task and feed connections to whoever owns the lobby.
pub trait Transport: Send + Sync + 'static {
    /// Waits for and accepts the next incoming connection.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send;
}
