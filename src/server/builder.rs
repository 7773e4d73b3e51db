// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::handler::RequestHandler;
use crate::server::listener::bind_tcp;
use anyhow::{Context, Result};
use hyper::server::conn::Http;
use std::future::Future;
use std::net::SocketAddr;

/// Builder so `main.rs` can inject its request handler.
pub struct ServerBuilder {
    addr: SocketAddr,
    handler: Option<RequestHandler>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;

        let listener = bind_tcp(self.addr).await?;
        tracing::info!("HTTP server listening on {}", self.addr);

        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    tracing::info!("HTTP server no longer accepting connections");
                    return Ok(());
                }
            };
            let svc = handler.for_peer(peer);

            // One task per connection.
            tokio::spawn(async move {
                let http = Http::new();
                if let Err(err) = http.serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }
    }
}
