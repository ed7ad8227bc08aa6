use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::{errors::ProxyError, Exchange, Middleware};
use crate::internal_events::{
    ProxyRequestBlocked, ProxyRequestCompleted, ProxyRequestFailed, ProxyRequestReceived,
};

/// Counts requests, errors, and blocks, tracks the in-flight gauge, and
/// records latency. Errors pass through unchanged; the bookkeeping here is
/// additive only.
pub struct Observer {
    next: Arc<dyn Middleware>,
}

impl Observer {
    pub fn new(next: Arc<dyn Middleware>) -> Self {
        Observer { next }
    }

    /// Runs the downstream stage in its own task and races it against the
    /// request's cancellation, so the exit bookkeeping runs even when
    /// downstream stalls indefinitely. When cancellation wins, the task is
    /// left to finish on its own.
    async fn run_isolated(&self, exchange: Exchange) -> Result<Exchange, ProxyError> {
        let cancel = exchange.cancellation().clone();
        let next = Arc::clone(&self.next);
        let mut task = tokio::spawn(async move { next.next(exchange).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(error) => Err(join_failure(error)),
            },
            _ = cancel.cancelled() => Err(ProxyError::Canceled),
        }
    }
}

#[async_trait]
impl Middleware for Observer {
    async fn init(&self, shutdown: CancellationToken) {
        self.next.init(shutdown).await;
    }

    async fn next(&self, exchange: Exchange) -> Result<Exchange, ProxyError> {
        emit!(ProxyRequestReceived);
        let start = Instant::now();

        let result = self.run_isolated(exchange).await;

        if let Err(error) = &result {
            match error.block_source() {
                Some(source) => emit!(ProxyRequestBlocked { source }),
                None => emit!(ProxyRequestFailed { error }),
            }
        }
        emit!(ProxyRequestCompleted {
            elapsed: start.elapsed(),
        });
        result
    }
}

fn join_failure(error: JoinError) -> ProxyError {
    match error.try_into_panic() {
        Ok(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            ProxyError::NextPanic { detail }
        }
        Err(_) => ProxyError::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::{Body, Request, Response};

    use super::*;
    use crate::{
        middleware::errors::BlockSource,
        test_util::{request_exchange, Mocker},
    };

    #[tokio::test]
    async fn responses_pass_through_untouched() {
        let observer = Observer::new(Mocker::new(|mut exchange: Exchange| async move {
            exchange.set_response(Response::new(Body::from("hello")));
            Ok(exchange)
        }));

        let mut exchange = observer.next(request_exchange()).await.unwrap();
        let response = exchange.take_response().unwrap();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, "hello".as_bytes());
    }

    #[tokio::test]
    async fn block_errors_propagate_unchanged() {
        let observer = Observer::new(Mocker::new(|_| async {
            Err(ProxyError::backpressure_backoff())
        }));

        let error = observer.next(request_exchange()).await.unwrap_err();
        assert_eq!(error.block_source(), Some(BlockSource::Backpressure));
    }

    #[tokio::test]
    async fn downstream_panics_become_errors() {
        let observer = Observer::new(Mocker::new(|_: Exchange| async { panic!("here") }));

        let error = observer.next(request_exchange()).await.unwrap_err();
        assert_eq!(error.to_string(), "panic calling Next: here");
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hung_downstream() {
        let observer = Observer::new(Mocker::new(|exchange: Exchange| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(exchange)
        }));

        let exchange = request_exchange();
        let cancel = exchange.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let error = observer.next(exchange).await.unwrap_err();
        assert!(matches!(error, ProxyError::Canceled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn request_reaches_downstream_byte_identical() {
        let observer = Observer::new(Mocker::new(|mut exchange: Exchange| async move {
            let body = hyper::body::to_bytes(exchange.request_mut().body_mut())
                .await
                .unwrap();
            assert_eq!(body, "query=up".as_bytes());
            assert_eq!(exchange.request().headers()["X-Custom"], "kept");
            exchange.set_response(Response::new(Body::empty()));
            Ok(exchange)
        }));

        let request = Request::post("/api/v1/query")
            .header("X-Custom", "kept")
            .body(Body::from("query=up"))
            .unwrap();
        observer
            .next(Exchange::for_tests(request))
            .await
            .expect("request should flow through");
    }
}
