//! Binary side channel.
//!
//! A buffer travels as a `buffer` header text frame immediately followed by
//! one binary frame. Payloads then refer to it as `{"_type":"Buffer","id":N}`.
//! The [`Outbox`] keeps a header, its binary frame and the command that
//! references it adjacent on the channel; [`BinaryReassembly`] pairs them up
//! on the receiving side.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::error::{LiveObjError, Result};
use crate::protocol::{BufferHeader, BufferId, Command};
use crate::transport::Frame;

/// Received buffers waiting to be referenced by a payload or taken by the
/// application. At most `capacity` are kept; the lowest id goes first.
#[derive(Debug)]
pub struct BinaryReassembly {
    expected: Option<BufferHeader>,
    received: BTreeMap<BufferId, Bytes>,
    capacity: usize,
}

impl Default for BinaryReassembly {
    fn default() -> Self {
        Self::with_capacity(ProtocolConfig::MAX_STORED_BUFFERS)
    }
}

impl BinaryReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            expected: None,
            received: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a `buffer` header. A second header before the announced binary
    /// frame arrives is a protocol violation.
    pub fn announce(&mut self, header: BufferHeader) -> Result<()> {
        if let Some(pending) = self.expected {
            return Err(LiveObjError::protocol(format!(
                "new binary data header received before receiving binary data for buffer {}",
                pending.id
            )));
        }
        self.expected = Some(header);
        Ok(())
    }

    /// Pair a binary frame with the outstanding header.
    ///
    /// On a length mismatch the frame is dropped and the header is cleared,
    /// so the next header starts a clean transfer.
    pub fn accept(&mut self, payload: Bytes) -> Result<BufferId> {
        let header = self
            .expected
            .take()
            .ok_or_else(|| LiveObjError::protocol("Binary data received without header"))?;

        if header.length != payload.len() {
            return Err(LiveObjError::protocol(format!(
                "binary data length mismatch for buffer {}: header says {}, received {}",
                header.id,
                header.length,
                payload.len()
            )));
        }

        self.received.insert(header.id, payload);
        while self.received.len() > self.capacity {
            if let Some((dropped, bytes)) = self.received.pop_first() {
                warn!(
                    "dropping unclaimed buffer {} ({} bytes): more than {} stored",
                    dropped,
                    bytes.len(),
                    self.capacity
                );
            }
        }
        Ok(header.id)
    }

    pub fn get(&self, id: BufferId) -> Option<Bytes> {
        self.received.get(&id).cloned()
    }

    pub fn take(&mut self, id: BufferId) -> Option<Bytes> {
        self.received.remove(&id)
    }

    /// Forget buffers a rejected payload referred to.
    pub fn discard(&mut self, ids: &[BufferId]) {
        for id in ids {
            if self.received.remove(id).is_some() {
                debug!("discarded buffer {} of a rejected payload", id);
            }
        }
    }

    pub fn is_awaiting_payload(&self) -> bool {
        self.expected.is_some()
    }

    pub fn stored(&self) -> usize {
        self.received.len()
    }
}

/// Writer half of a session.
///
/// Batches are written under a lock, so buffer frames and the command that
/// references them are never interleaved with another task's frames.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Frame>,
    order: Arc<Mutex<()>>,
    next_buffer_id: Arc<AtomicU64>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx,
            order: Arc::new(Mutex::new(())),
            next_buffer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Counter the encoder draws buffer ids from.
    pub fn buffer_ids(&self) -> &AtomicU64 {
        &self.next_buffer_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a command preceded by the buffers its payload references.
    pub fn send_command(&self, command: &Command, transfers: Vec<(BufferId, Bytes)>) -> Result<()> {
        let mut frames = Vec::with_capacity(transfers.len() * 2 + 1);
        for (id, bytes) in transfers {
            frames.extend(transfer_frames(id, bytes)?);
        }
        frames.push(command.to_frame()?);
        self.send_batch(frames)
    }

    /// Send a standalone buffer and return its id.
    pub fn send_binary(&self, bytes: Bytes) -> Result<BufferId> {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        self.send_batch(transfer_frames(id, bytes)?.into())?;
        Ok(id)
    }

    fn send_batch(&self, frames: Vec<Frame>) -> Result<()> {
        let _guard = self.order.lock().unwrap_or_else(|e| e.into_inner());
        for frame in frames {
            if self.tx.send(frame).is_err() {
                warn!("Outbox closed, dropping frames");
                return Err(LiveObjError::Disconnected);
            }
        }
        Ok(())
    }
}

fn transfer_frames(id: BufferId, bytes: Bytes) -> Result<[Frame; 2]> {
    let header = Command::Buffer(BufferHeader {
        id,
        length: bytes.len(),
    });
    Ok([header.to_frame()?, Frame::Binary(bytes)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_payload() {
        let mut r = BinaryReassembly::new();
        r.announce(BufferHeader { id: 3, length: 4 }).unwrap();
        assert!(r.is_awaiting_payload());

        let id = r.accept(Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(id, 3);
        assert!(!r.is_awaiting_payload());
        assert_eq!(r.get(3).unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(r.take(3).unwrap().len(), 4);
        assert_eq!(r.stored(), 0);
    }

    #[test]
    fn test_payload_without_header() {
        let mut r = BinaryReassembly::new();
        let err = r.accept(Bytes::from_static(b"x")).unwrap_err();
        assert!(err.to_string().contains("without header"));
        assert_eq!(r.stored(), 0);
    }

    #[test]
    fn test_second_header_rejected() {
        let mut r = BinaryReassembly::new();
        r.announce(BufferHeader { id: 1, length: 1 }).unwrap();
        assert!(r.announce(BufferHeader { id: 2, length: 1 }).is_err());

        // the first header is still the one being waited for
        assert_eq!(r.accept(Bytes::from_static(b"z")).unwrap(), 1);
    }

    #[test]
    fn test_length_mismatch_clears_header() {
        let mut r = BinaryReassembly::new();
        r.announce(BufferHeader { id: 1, length: 10 }).unwrap();
        assert!(r.accept(Bytes::from_static(b"short")).is_err());
        assert!(r.get(1).is_none());
        assert!(!r.is_awaiting_payload());

        r.announce(BufferHeader { id: 2, length: 2 }).unwrap();
        assert_eq!(r.accept(Bytes::from_static(b"ok")).unwrap(), 2);
    }

    fn receive(r: &mut BinaryReassembly, id: BufferId, data: &'static [u8]) {
        r.announce(BufferHeader {
            id,
            length: data.len(),
        })
        .unwrap();
        r.accept(Bytes::from_static(data)).unwrap();
    }

    #[test]
    fn test_discard_forgets_rejected_buffers() {
        let mut r = BinaryReassembly::new();
        receive(&mut r, 1, b"a");
        receive(&mut r, 2, b"b");
        r.discard(&[1, 7]);
        assert!(r.get(1).is_none());
        assert_eq!(r.get(2).unwrap(), Bytes::from_static(b"b"));
        assert_eq!(r.stored(), 1);
    }

    #[test]
    fn test_unclaimed_buffers_are_capped() {
        let mut r = BinaryReassembly::with_capacity(2);
        receive(&mut r, 1, b"a");
        receive(&mut r, 2, b"b");
        receive(&mut r, 3, b"c");
        assert_eq!(r.stored(), 2);
        assert!(r.get(1).is_none());
        assert!(r.get(3).is_some());

        let mut r = BinaryReassembly::new();
        for id in 0..(ProtocolConfig::MAX_STORED_BUFFERS as u64 + 10) {
            receive(&mut r, id, b"x");
        }
        assert_eq!(r.stored(), ProtocolConfig::MAX_STORED_BUFFERS);
    }

    #[tokio::test]
    async fn test_outbox_keeps_transfer_adjacent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        let cmd = Command::Alive(crate::protocol::AliveCommand { alive_ids: vec![0] });

        outbox
            .send_command(&cmd, vec![(5, Bytes::from_static(b"data"))])
            .unwrap();

        match rx.recv().await.unwrap() {
            Frame::Text(t) => match Command::parse(&t).unwrap() {
                Command::Buffer(h) => assert_eq!(h, BufferHeader { id: 5, length: 4 }),
                other => panic!("Expected buffer header, got {:?}", other),
            },
            other => panic!("Expected text frame, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), Frame::Binary(Bytes::from_static(b"data")));
        assert!(matches!(rx.recv().await.unwrap(), Frame::Text(_)));
    }

    #[tokio::test]
    async fn test_send_binary_allocates_ids() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        let a = outbox.send_binary(Bytes::from_static(b"a")).unwrap();
        let b = outbox.send_binary(Bytes::from_static(b"b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_send_on_closed_outbox() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outbox = Outbox::new(tx);
        assert!(outbox.is_closed());
        match outbox.send_binary(Bytes::from_static(b"a")) {
            Err(LiveObjError::Disconnected) => {}
            other => panic!("Expected Disconnected, got {:?}", other),
        }
    }
}
