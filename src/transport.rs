//! The message-oriented link a [`Connection`](crate::Connection) runs over.

use crate::event::CloseInfo;
use std::{future::Future, io};
use thiserror::Error;
use tokio::sync::mpsc;

/// One frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the link. No further frames follow.
    Closed(Option<CloseInfo>),
}

/// A bidirectional, message-framed link to one peer.
///
/// `recv` must be cancel-safe: the driver polls it alongside its outbound
/// queue and drops the future whenever an outbound frame is ready first.
pub trait Transport: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Inbound, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("transport is closed")]
    Closed,
}

/// One end of an in-process link created by [`MemoryTransport::pair`].
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Self {
            tx: Some(a_tx),
            rx: a_rx,
        };
        let b = Self {
            tx: Some(b_tx),
            rx: b_rx,
        };
        (a, b)
    }
}

impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        Ok(match self.rx.recv().await {
            Some(text) => Inbound::Text(text),
            None => Inbound::Closed(None),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
