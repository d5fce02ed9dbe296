//! A single participant connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{ConnectionId, TransportError};

/// Largest chunk a single [`Connection::recv`] call returns.
///
/// Matches the largest frame the wire protocol ever produces.
pub const MAX_READ_LEN: usize = 1300;

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream to one participant.
///
/// The two halves sit behind separate locks: a task parked in
/// [`recv()`](Self::recv) waiting for a reply does not stop other tasks
/// from broadcasting to the same participant.
///
/// Dropping a `recv()` future is safe, no bytes are lost. Dropping a
/// `send()` future midway may leave a partial frame on the wire, so
/// callers only cancel at receive points.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
}

impl Connection {
    /// Wraps an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        // Disabling Nagle keeps small reply frames from being delayed.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::build(peer, Box::new(reader), Box::new(writer))
    }

    /// Wraps any async byte stream, for example one end of
    /// [`tokio::io::duplex`].
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::build(None, Box::new(reader), Box::new(writer))
    }

    fn build(
        peer: Option<SocketAddr>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Self {
        let id = ConnectionId::new(
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        );
        Self {
            id,
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address, when the stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes the whole buffer to the peer.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)
    }

    /// Receives whatever the next read produces.
    ///
    /// Returns `Ok(None)` when the peer closed the connection.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buf = vec![0u8; MAX_READ_LEN];
        let n = self
            .reader
            .lock()
            .await
            .read(&mut buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Shuts down the write side, which the peer observes as end of stream.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
