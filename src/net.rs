//! WebSocket plumbing: the [`Transport`] adapter, client dialing and the accept loop.

pub mod client;
pub mod server;

use crate::{
    event::CloseInfo,
    transport::{Inbound, Transport, TransportError},
};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::protocol::Message as WsMessage, WebSocketStream};

/// Carries JSON envelopes as WebSocket text frames.
///
/// Binary frames are accepted on receive and handed on as raw bytes.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Inbound::Text(text.to_string())),
                Some(Ok(WsMessage::Binary(data))) => return Ok(Inbound::Binary(data.to_vec())),
                Some(Ok(WsMessage::Close(frame))) => {
                    return Ok(Inbound::Closed(frame.map(|frame| CloseInfo {
                        code: frame.code.into(),
                        reason: frame.reason.to_string(),
                    })));
                }
                // Pongs are queued by tungstenite itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Inbound::Closed(None)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
