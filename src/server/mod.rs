pub mod api;
pub mod bootstrap;
pub mod runtime;
mod state;
pub mod ws;

pub use state::{DataLayout, ManagerState};

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the management API server (JSON + WebSocket) until shutdown.
pub async fn run_api_server(listen: &str, state: ManagerState, shutdown: Arc<Notify>) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: api listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: api: stop accepting new connections");
                return Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: api: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move {
                    if ws::is_upgrade_request(&req) {
                        Ok(ws::handle_upgrade(req, state))
                    } else {
                        api::handle_api(req, state).await
                    }
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: api: connection error, peer={}, error={}", peer_addr, e);
                }
            }
        });
    }
}
