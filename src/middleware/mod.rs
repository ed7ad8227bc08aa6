//! The middleware chain. Every stage implements [`Middleware`] and wraps the
//! next one; the same composition backs two entry shells, one serving
//! inbound requests and one wrapping an outbound HTTP client. Only the
//! entries render errors to a user-visible form.

pub mod backpressure;
pub mod blocker;
pub mod errors;
pub mod headers;
pub mod jitterer;
pub mod observer;
pub mod query_cost;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::{header, Request, Response, StatusCode};
use hyper::Body;
use serde::Serialize;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

pub use self::backpressure::{Backpressure, BackpressureConfig, SignalSpec};
pub use self::blocker::{BlockPattern, Blocker, BlockerConfig};
pub use self::errors::{BlockSource, ProxyError};
pub use self::jitterer::Jitterer;
pub use self::observer::Observer;
pub use self::query_cost::QueryCost;

use self::errors::UpstreamSnafu;
use crate::{
    config::{ConfigError, ProxyConfig},
    http::HttpClient,
};

/// One stage of the middleware chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Called once at startup, top-down. Stages that own background work
    /// spawn it here; canceling the token ends that work.
    async fn init(&self, shutdown: CancellationToken);

    /// Processes the carrier, forwarding it to the next stage or refusing
    /// the request.
    async fn next(&self, exchange: Exchange) -> Result<Exchange, ProxyError>;
}

/// The carrier threaded through the chain: the request on its way down, the
/// response on its way back up, and the cancellation handle raced by stages
/// that wait.
#[derive(Debug)]
pub struct Exchange {
    request: Request<Body>,
    response: Option<Response<Body>>,
    cancel: CancellationToken,
}

impl Exchange {
    pub fn new(request: Request<Body>, cancel: CancellationToken) -> Self {
        Exchange {
            request,
            response: None,
            cancel,
        }
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    fn take_request(&mut self) -> Request<Body> {
        std::mem::replace(&mut self.request, Request::new(Body::empty()))
    }

    pub fn set_response(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Body>> {
        self.response.take()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[cfg(test)]
    pub fn for_tests(request: Request<Body>) -> Self {
        Self::new(request, CancellationToken::new())
    }
}

/// Handler invoked by the server-form terminal stage.
pub type RequestHandler =
    Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, crate::Result<Response<Body>>> + Send + Sync>;

/// Assembles the enabled stages around the terminal `exit`. The composition
/// order is fixed: Observer → Blocker → Jitterer → Backpressure → exit.
/// Observing outermost counts blocked requests too; jitter runs before any
/// capacity check so bursty clients spread out; admission runs last so a
/// refused request never holds a concurrency slot.
pub fn layer_from_config(
    config: &ProxyConfig,
    client: &HttpClient,
    exit: Arc<dyn Middleware>,
) -> Result<Arc<dyn Middleware>, ConfigError> {
    let mut chain = exit;

    if config.backpressure.enable_backpressure {
        chain = Arc::new(Backpressure::new(
            chain,
            &config.backpressure,
            client.clone(),
        ));
    }

    if config.enable_jitter {
        chain = Arc::new(Jitterer::new(
            chain,
            config.jitter_delay,
            config.enable_criticality,
        ));
    }

    if config.blocker.enable_blocker {
        chain = Arc::new(Blocker::new(chain, &config.blocker)?);
    }

    if config.enable_observer {
        chain = Arc::new(Observer::new(chain));
    }

    Ok(chain)
}

/// Server-form entry: runs inbound requests through the chain into a
/// caller-provided handler, rendering chain errors as the standard envelope.
pub struct ServeEntry {
    chain: Arc<dyn Middleware>,
    timeout: Option<Duration>,
}

impl ServeEntry {
    pub fn from_config(
        config: &ProxyConfig,
        client: &HttpClient,
        handler: RequestHandler,
    ) -> Result<Self, ConfigError> {
        let exit = Arc::new(ServeExit { handler });
        Ok(ServeEntry {
            chain: layer_from_config(config, client, exit)?,
            timeout: config.client_timeout,
        })
    }

    pub async fn init(&self, shutdown: CancellationToken) {
        self.chain.init(shutdown).await;
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let cancel = CancellationToken::new();
        arm_deadline(&cancel, self.timeout);

        let result = self.chain.next(Exchange::new(request, cancel.clone())).await;
        cancel.cancel();

        match result {
            Ok(mut exchange) => match exchange.take_response() {
                Some(response) => response,
                None => error_response(&ProxyError::MissingResponse),
            },
            Err(error) => error_response(&error),
        }
    }
}

/// Cancels the request token once `timeout` elapses. The watcher parks on
/// the token as well, so it never outlives the request it guards.
fn arm_deadline(cancel: &CancellationToken, timeout: Option<Duration>) {
    if let Some(timeout) = timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });
    }
}

struct ServeExit {
    handler: RequestHandler,
}

#[async_trait]
impl Middleware for ServeExit {
    async fn init(&self, _shutdown: CancellationToken) {}

    async fn next(&self, mut exchange: Exchange) -> Result<Exchange, ProxyError> {
        let request = exchange.take_request();
        let response = (self.handler)(request)
            .await
            .map_err(|source| ProxyError::Handler { source })?;
        exchange.set_response(response);
        Ok(exchange)
    }
}

/// Transport-form entry: the terminal stage performs the outbound round
/// trip itself, so the same chain can wrap an HTTP client.
pub struct TransportEntry {
    chain: Arc<dyn Middleware>,
}

impl TransportEntry {
    pub fn from_config(config: &ProxyConfig, client: &HttpClient) -> Result<Self, ConfigError> {
        let exit = Arc::new(TransportExit {
            client: client.clone(),
        });
        Ok(TransportEntry {
            chain: layer_from_config(config, client, exit)?,
        })
    }

    pub async fn init(&self, shutdown: CancellationToken) {
        self.chain.init(shutdown).await;
    }

    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let cancel = CancellationToken::new();
        let result = self.chain.next(Exchange::new(request, cancel.clone())).await;
        cancel.cancel();

        let mut exchange = result?;
        exchange.take_response().ok_or(ProxyError::MissingResponse)
    }
}

struct TransportExit {
    client: HttpClient,
}

#[async_trait]
impl Middleware for TransportExit {
    async fn init(&self, _shutdown: CancellationToken) {}

    async fn next(&self, mut exchange: Exchange) -> Result<Exchange, ProxyError> {
        let request = exchange.take_request();
        let response = self.client.send(request).await.context(UpstreamSnafu)?;
        exchange.set_response(response);
        Ok(exchange)
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    status: &'static str,
    #[serde(rename = "errorType")]
    error_type: &'static str,
    error: String,
}

/// Renders the standard error envelope. Blocks map to 429; everything else
/// is a 500 with a `proxy error:` prefix.
pub fn error_response(error: &ProxyError) -> Response<Body> {
    let (status, text) = if error.is_blocked() {
        (StatusCode::TOO_MANY_REQUESTS, error.to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("proxy error: {}", error),
        )
    };

    let body = serde_json::to_vec(&ApiErrorResponse {
        status: "error",
        error_type: "throttle-proxy",
        error: text,
    })
    .expect("error envelope is always serializable");

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from(body))
        .expect("error response builder cannot fail")
}
