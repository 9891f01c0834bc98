//! WebSocket gateway server
//!
//! Accepts terminal sessions on a plain TCP listener. Session parameters ride
//! in the upgrade request's query string; a request that fails validation is
//! answered with one structured error frame and a policy-violation close, and
//! never touches the pool.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{error, info, warn};

use super::session::{reject, run_session, SessionParams};
use super::Gateway;

pub struct GatewayServer {
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn serve(&self, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("gateway listening on {}", listener.local_addr()?);
        self.run(listener).await
    }

    /// Accept loop over an existing listener (tests bind to port 0 first).
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                handle_socket(gateway, stream, peer).await;
            });
        }
    }
}

async fn handle_socket(gateway: Arc<Gateway>, stream: TcpStream, peer: SocketAddr) {
    // Nagle hurts interactive latency far more than it saves bandwidth here.
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    let mut query: Option<String> = None;
    let ws = match accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().map(str::to_string);
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            error!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };

    info!(%peer, "websocket connection accepted");

    match SessionParams::from_query(query.as_deref().unwrap_or("")) {
        Ok(params) => run_session(gateway, ws, params).await,
        Err(e) => reject(ws, e.to_string(), CloseCode::Policy).await,
    }
}
