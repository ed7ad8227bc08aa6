use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use tokio_util::sync::CancellationToken;

use super::{errors::ProxyError, headers, query_cost::parse_duration, Exchange, Middleware};

pub const NO_JITTER: Duration = Duration::ZERO;

/// Sleeps for a uniformly random duration in `[0, delay)` before forwarding,
/// spreading bursty clients out ahead of any capacity check.
pub struct Jitterer {
    delay: Duration,
    criticality: bool,
    next: Arc<dyn Middleware>,
}

impl Jitterer {
    pub fn new(next: Arc<dyn Middleware>, delay: Duration, criticality: bool) -> Self {
        Jitterer {
            delay,
            criticality,
            next,
        }
    }

    /// The jitter window for this request. Criticality wins: `CRITICAL_PLUS`
    /// requests skip jitter outright. Otherwise a client-provided wait budget
    /// can only widen the configured window, never shrink it.
    fn jitter_window(&self, exchange: &Exchange) -> Result<Duration, ProxyError> {
        let request = exchange.request();
        if self.criticality && headers::criticality(request) == headers::CRITICAL_PLUS {
            return Ok(NO_JITTER);
        }

        match request.headers().get(headers::CAN_WAIT) {
            Some(value) => {
                let value = value.to_str().map_err(|_| ProxyError::InvalidDuration {
                    value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                })?;
                let budget = parse_duration(value)?;
                Ok(budget.max(self.delay))
            }
            None => Ok(self.delay),
        }
    }

    async fn sleep(&self, exchange: &Exchange, window: Duration) -> Result<(), ProxyError> {
        if window.is_zero() {
            return Ok(());
        }

        let jitter = thread_rng().gen_range(Duration::ZERO..window);
        tokio::select! {
            _ = tokio::time::sleep(jitter) => Ok(()),
            _ = exchange.cancellation().cancelled() => Err(ProxyError::Canceled),
        }
    }
}

#[async_trait]
impl Middleware for Jitterer {
    async fn init(&self, shutdown: CancellationToken) {
        self.next.init(shutdown).await;
    }

    async fn next(&self, exchange: Exchange) -> Result<Exchange, ProxyError> {
        let window = self.jitter_window(&exchange)?;
        self.sleep(&exchange, window).await?;
        self.next.next(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use hyper::{Body, Request};

    use super::*;
    use crate::test_util::Mocker;

    fn jitterer(delay: Duration, criticality: bool) -> Jitterer {
        Jitterer::new(Mocker::forwarding(), delay, criticality)
    }

    fn request_with_headers(headers: &[(&str, &str)]) -> Exchange {
        let mut builder = Request::get("/api/v1/query");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Exchange::for_tests(builder.body(Body::empty()).unwrap())
    }

    #[test]
    fn criticality_disabled_ignores_headers() {
        let jitterer = jitterer(Duration::from_secs(1), false);
        let exchange = request_with_headers(&[(headers::CRITICALITY, headers::CRITICAL_PLUS)]);
        assert_eq!(
            jitterer.jitter_window(&exchange).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn critical_plus_gets_no_jitter() {
        let jitterer = jitterer(Duration::from_secs(1), true);
        let exchange = request_with_headers(&[(headers::CRITICALITY, headers::CRITICAL_PLUS)]);
        assert_eq!(jitterer.jitter_window(&exchange).unwrap(), NO_JITTER);
    }

    #[test]
    fn can_wait_below_configured_delay_is_ignored() {
        let jitterer = jitterer(Duration::from_secs(1), true);
        let exchange = request_with_headers(&[
            (headers::CRITICALITY, headers::CRITICAL),
            (headers::CAN_WAIT, "1ms"),
        ]);
        assert_eq!(
            jitterer.jitter_window(&exchange).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn can_wait_widens_the_window() {
        let jitterer = jitterer(Duration::from_secs(1), true);
        let exchange = request_with_headers(&[(headers::CAN_WAIT, "2m")]);
        assert_eq!(
            jitterer.jitter_window(&exchange).unwrap(),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn invalid_can_wait_is_an_error() {
        let jitterer = jitterer(Duration::from_secs(1), true);
        let exchange = request_with_headers(&[(headers::CAN_WAIT, "invalid")]);
        let error = jitterer.jitter_window(&exchange).unwrap_err();
        assert!(!error.is_blocked());
        assert_eq!(
            error.to_string(),
            "cannot parse \"invalid\" to a valid duration"
        );
    }

    #[test]
    fn no_headers_uses_configured_delay() {
        let jitterer = jitterer(Duration::from_secs(1), true);
        let exchange = request_with_headers(&[]);
        assert_eq!(
            jitterer.jitter_window(&exchange).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_stays_within_the_window() {
        let jitterer = jitterer(Duration::from_secs(3600), false);
        let exchange = request_with_headers(&[]);
        jitterer
            .next(exchange)
            .await
            .expect("sleep should complete under paused time");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let jitterer = jitterer(Duration::from_secs(3600), false);
        let exchange = request_with_headers(&[]);
        exchange.cancellation().cancel();

        let error = jitterer.next(exchange).await.unwrap_err();
        assert!(matches!(error, ProxyError::Canceled));
    }
}
