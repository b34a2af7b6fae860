use super::WsTransport;
use crate::{
    connection::{Connection, OnOpen},
    dispatcher::DispatchTable,
};
use std::{io, net::Ipv4Addr, sync::Arc};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

type OnConnect = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Accepts WebSocket peers and serves each over its own [`Connection`].
///
/// Every connection shares the same [`DispatchTable`].
pub struct Server {
    dispatch: Arc<DispatchTable>,
    on_connect: Option<OnConnect>,
}

impl Server {
    pub fn new(dispatch: impl Into<Arc<DispatchTable>>) -> Self {
        Self {
            dispatch: dispatch.into(),
            on_connect: None,
        }
    }

    /// Run `f` once a peer's connection is open. Calls made inside `f` reach that peer.
    pub fn on_connect(mut self, f: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub async fn serve_tcp(self, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "accepting websocket peers");
        loop {
            let (sock, addr) = listener.accept().await?;
            let dispatch = Arc::clone(&self.dispatch);
            let on_connect = self.on_connect.clone();

            tokio::spawn(async move {
                let stream = match accept_async(sock).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%addr, error = %e, "websocket handshake failed");
                        return;
                    }
                };
                debug!(%addr, "peer connected");
                let on_open = on_connect
                    .map(|f| -> OnOpen { Box::new(move |conn: &Connection| f(conn)) });
                let _ = Connection::attach(WsTransport::new(stream), dispatch, on_open);
            });
        }
    }
}
