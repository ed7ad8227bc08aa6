//! Shared helpers for unit tests.

use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use tokio_util::sync::CancellationToken;

use crate::middleware::{Exchange, Middleware, ProxyError};

type NextFn = dyn Fn(Exchange) -> BoxFuture<'static, Result<Exchange, ProxyError>> + Send + Sync;

/// A middleware stage scripted by a closure, standing in for whatever is
/// downstream of the stage under test.
pub struct Mocker {
    next_fn: Box<NextFn>,
}

impl Mocker {
    pub fn new<F, Fut>(next_fn: F) -> Arc<dyn Middleware>
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Exchange, ProxyError>> + Send + 'static,
    {
        Arc::new(Mocker {
            next_fn: Box::new(move |exchange| next_fn(exchange).boxed()),
        })
    }

    /// A terminal stage that accepts everything and returns the carrier
    /// untouched.
    pub fn forwarding() -> Arc<dyn Middleware> {
        Self::new(|exchange| async move { Ok(exchange) })
    }
}

#[async_trait]
impl Middleware for Mocker {
    async fn init(&self, _shutdown: CancellationToken) {}

    async fn next(&self, exchange: Exchange) -> Result<Exchange, ProxyError> {
        (self.next_fn)(exchange).await
    }
}

/// A plain GET exchange for stages that do not care about the request.
pub fn request_exchange() -> Exchange {
    Exchange::for_tests(
        Request::get("/api/v1/query?query=up")
            .body(Body::empty())
            .unwrap(),
    )
}

/// Serves a canned response on an ephemeral local port.
pub async fn serve_fixture(status: u16, body: &'static str) -> SocketAddr {
    let make_svc = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |_request: Request<Body>| async move {
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(Body::from(body))
                    .unwrap(),
            )
        }))
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// Polls `condition` until it holds, panicking after a generous timeout.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for condition");
}
