//! Message channel abstraction.
//!
//! Sessions never see sockets: they read [`Frame`]s from a [`Channel`] and
//! write frames into its outgoing sender. A transport (WebSocket, in-memory
//! pair) only pumps frames between the channel and the wire. Frames are
//! delivered in order; a closed receiver means the peer is gone.

pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::server::Server;

pub use ws::WsConnector;

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Both directions of a connected channel.
#[derive(Debug)]
pub struct Channel {
    pub incoming: mpsc::UnboundedReceiver<Frame>,
    pub outgoing: mpsc::UnboundedSender<Frame>,
}

impl Channel {
    pub fn new(
        incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self { incoming, outgoing }
    }
}

/// Two channels wired back to back.
pub fn memory_pair() -> (Channel, Channel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (Channel::new(b_rx, a_tx), Channel::new(a_rx, b_tx))
}

/// Opens a channel to a server; called again by the client after each
/// disconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Channel>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Connects straight into an in-process [`Server`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: Server,
}

impl MemoryConnector {
    pub fn new(server: Server) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Channel> {
        let (local, remote) = memory_pair();
        self.server.accept(remote)?;
        Ok(local)
    }

    fn describe(&self) -> String {
        "in-process server".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_crossed() {
        let (mut a, mut b) = memory_pair();

        a.outgoing.send(Frame::Text("ping".into())).unwrap();
        b.outgoing
            .send(Frame::Binary(Bytes::from_static(b"pong")))
            .unwrap();

        assert_eq!(b.incoming.recv().await, Some(Frame::Text("ping".into())));
        assert_eq!(
            a.incoming.recv().await,
            Some(Frame::Binary(Bytes::from_static(b"pong")))
        );
    }

    #[tokio::test]
    async fn test_memory_pair_close() {
        let (a, mut b) = memory_pair();
        drop(a);
        assert_eq!(b.incoming.recv().await, None);
    }
}
