//! Per-participant connection: identity, role, bounded outbound queue, and the
//! two pumps that pair it with a transport.
//!
//! The transport is any `Stream` of text frames plus a `Sink` of [`Frame`]s; the
//! server adapts an axum `WebSocket` to that shape, tests use in-memory channels.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};

use super::protocol::{ClientMessage, Frame, ProtocolError};
use super::session::{Inbound, SessionHandle};

/// Opaque, process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Team,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Team => "team",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "team" => Ok(Role::Team),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// A registered participant as the session sees it.
///
/// Not `Clone`: the session holds the only sender of the outbound queue, so
/// dropping the `Connection` closes the queue and ends the writer pump once the
/// queue is drained. [`Connection::disconnect`] tears the transport down at once.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: String,
    role: Role,
    outbound: mpsc::Sender<Frame>,
    disconnect: oneshot::Sender<()>,
}

/// Transport side of a [`Connection`]: the frames to write and the signal that
/// the session has cut the connection off.
#[derive(Debug)]
pub struct Outbound {
    frames: mpsc::Receiver<Frame>,
    disconnect: oneshot::Receiver<()>,
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        self.frames.try_recv()
    }

    /// True once the session has called [`Connection::disconnect`].
    pub fn is_disconnected(&mut self) -> bool {
        matches!(self.disconnect.try_recv(), Ok(()))
    }
}

impl Connection {
    /// New connection with an outbound queue bounded at `capacity` frames.
    pub fn new(identity: impl Into<String>, role: Role, capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let conn = Self {
            id: ConnectionId::new(),
            identity: identity.into(),
            role,
            outbound: tx,
            disconnect: disconnect_tx,
        };
        let outbound = Outbound {
            frames: rx,
            disconnect: disconnect_rx,
        };
        (conn, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Enqueue without waiting. A full queue is reported, never awaited.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Drop the connection and abort both pumps without draining what is queued.
    /// Used for peers that stopped reading.
    pub fn disconnect(self) {
        let _ = self.disconnect.send(());
    }
}

/// Register `connection` with the session and pump frames both ways until either
/// side ends or the session disconnects it; then deregister. Returns once the
/// connection is torn down.
pub async fn serve<R, W>(
    connection: Connection,
    outbound: Outbound,
    session: SessionHandle,
    reader: R,
    writer: W,
) where
    R: Stream<Item = Result<String, TransportError>>,
    W: Sink<Frame, Error = TransportError>,
{
    let id = connection.id();
    let identity = connection.identity().to_string();
    let role = connection.role();
    if let Err(e) = session.register(connection).await {
        log::warn!("{} '{}' could not join: {}", role, identity, e);
        return;
    }
    log::info!("{} '{}' connected to session {}", role, identity, session.code());

    let Outbound { frames, disconnect } = outbound;
    tokio::select! {
        res = read_pump(id, &identity, reader, &session) => {
            if let Err(e) = res {
                log::debug!("read side of '{}' ended: {}", identity, e);
            }
        }
        res = write_pump(frames, writer) => {
            if let Err(e) = res {
                log::debug!("write side of '{}' ended: {}", identity, e);
            }
        }
        // A plain drop of the sender disables this branch so the writer can drain.
        Ok(()) = disconnect => {
            log::warn!("'{}' disconnected by session {}", identity, session.code());
        }
    }

    session.deregister(id).await;
    log::info!("{} '{}' left session {}", role, identity, session.code());
}

/// Decode each frame, stamp the sender, and forward it in order. Bad frames are
/// logged and skipped; the pump only stops on transport end or a gone session.
async fn read_pump<R>(
    id: ConnectionId,
    identity: &str,
    reader: R,
    session: &SessionHandle,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<String, TransportError>>,
{
    futures_util::pin_mut!(reader);
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match ClientMessage::decode(&text) {
            Ok(message) => {
                let inbound = Inbound {
                    from: id,
                    sender: identity.to_string(),
                    message,
                };
                if session.submit(inbound).await.is_err() {
                    return Ok(());
                }
            }
            Err(ProtocolError::UnknownType(t)) => {
                log::info!("ignoring unknown message type '{}' from '{}'", t, identity);
            }
            Err(e) => {
                log::warn!("dropping frame from '{}': {}", identity, e);
            }
        }
    }
    Ok(())
}

/// Drain the outbound queue onto the transport. Ends cleanly once the queue is
/// closed (and drained), or with the write error.
async fn write_pump<W>(mut frames: mpsc::Receiver<Frame>, writer: W) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError>,
{
    futures_util::pin_mut!(writer);
    while let Some(frame) = frames.recv().await {
        writer.send(frame).await?;
    }
    let _ = writer.close().await;
    Ok(())
}
