//! In-process duplex socket pair.
//!
//! Useful for embedding a server and client in one process, and for tests.

use futures_util::{sink, stream, Sink, Stream};
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::{KartonError, KartonResult};

pub type MemorySink = Pin<Box<dyn Sink<Frame, Error = KartonError> + Send>>;
pub type MemoryStream = Pin<Box<dyn Stream<Item = KartonResult<Frame>> + Send>>;

/// One end of an in-memory duplex connection
pub struct MemorySocket {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create two connected sockets; frames written to one are read from the other
pub fn duplex() -> (MemorySocket, MemorySocket) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemorySocket { tx: a_tx, rx: a_rx },
        MemorySocket { tx: b_tx, rx: b_rx },
    )
}

impl MemorySocket {
    /// Split into the halves expected by [`super::Transport::attach`]
    pub fn split(self) -> (MemorySink, MemoryStream) {
        let sink = sink::unfold(self.tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| KartonError::ConnectionClosed)?;
            Ok::<_, KartonError>(tx)
        });
        let stream = stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        });
        (Box::pin(sink), Box::pin(stream))
    }

    /// Write a raw frame to the peer
    pub fn send(&self, frame: Frame) -> KartonResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| KartonError::ConnectionClosed)
    }

    /// Read the next raw frame from the peer; `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
