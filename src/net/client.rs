use super::WsTransport;
use crate::{config::ConnectionConfig, transport::TransportError};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::debug;

pub type ClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

/// Dial the endpoint described by `config` and complete the WebSocket handshake.
pub async fn connect(config: &ConnectionConfig) -> Result<ClientTransport, TransportError> {
    let url = config.url();
    let (stream, response) = connect_async(url.as_str()).await?;
    debug!(%url, status = %response.status(), "websocket handshake complete");
    Ok(WsTransport::new(stream))
}
