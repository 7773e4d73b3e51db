// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::{ClientAddr, LoadBalancer};

/// Adapts `LoadBalancer::handle` to a hyper service for one connection.
#[derive(Clone)]
pub struct RequestHandler {
    balancer: Arc<LoadBalancer>,
    peer: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self {
            balancer,
            peer: None,
        }
    }

    /// Handler that stamps every request with the connection's peer address.
    pub fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            balancer: self.balancer.clone(),
            peer: Some(peer),
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let balancer = self.balancer.clone();
        if let Some(peer) = self.peer {
            req.extensions_mut().insert(ClientAddr(peer));
        }

        Box::pin(async move {
            let response = balancer.handle(req).await.unwrap_or_else(|e| {
                tracing::error!(%e, "proxy error");
                Response::from(e)
            });
            Ok(response)
        })
    }
}
