//! Admission control built on Additive-Increase / Multiplicative-Decrease,
//! the congestion-control shape TCP uses. The controller admits up to
//! `watermark` concurrent requests; every release widens the window by one
//! (additive) while polled load signals shrink it in proportion to their
//! strength (multiplicative). The window never drops below the configured
//! minimum, so some traffic always gets through.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use hyper::{Body, Request};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use url::{form_urlencoded, Url};

use super::{
    errors::ProxyError,
    query_cost::{self, QueryCost},
    Exchange, Middleware,
};
use crate::{
    config::{
        ConfigError, CongestionWindowMaxBelowMinSnafu, CongestionWindowMinBelowOneSnafu,
        EmergencyBelowWarnThresholdSnafu, InvalidMonitorUrlSnafu, NegativeSignalThresholdsSnafu,
        NegativeThrottleCurveSnafu, SignalRequiredSnafu,
    },
    http::HttpClient,
    internal_events::{
        CongestionControlUpdated, CongestionWatermarkChanged, CongestionWindowLimits,
        SignalPollError, SignalThresholds, SignalValueUpdated,
    },
};

pub const SIGNAL_POLL_CADENCE: Duration = Duration::from_secs(30);
pub const MONITOR_QUERY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_THROTTLE_CURVE: f64 = 4.0;

/// One periodically sampled load signal with its throttling thresholds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SignalSpec {
    /// Optional label used to tag per-signal operational metrics. When
    /// unset, those metrics are suppressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Query forwarded verbatim to the metrics endpoint.
    pub query: String,

    /// Load value at which throttling begins.
    pub warn: f64,

    /// Load value at which the maximum share of requests is shed.
    pub emergency: f64,

    /// Aggressiveness of the throttle between the two thresholds.
    #[serde(default = "default_throttle_curve")]
    pub curve: f64,
}

const fn default_throttle_curve() -> f64 {
    DEFAULT_THROTTLE_CURVE
}

impl SignalSpec {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.curve >= 0.0, NegativeThrottleCurveSnafu);
        ensure!(
            self.warn >= 0.0 && self.emergency >= 0.0,
            NegativeSignalThresholdsSnafu
        );
        ensure!(self.emergency > self.warn, EmergencyBelowWarnThresholdSnafu);
        Ok(())
    }

    /// Fraction of requests to shed for the sampled value, saturating at the
    /// thresholds.
    fn throttle_percent(&self, value: f64) -> f64 {
        if value <= self.warn {
            return 0.0;
        }
        if value >= self.emergency {
            return 1.0;
        }

        let curve = if self.curve == 0.0 {
            DEFAULT_THROTTLE_CURVE
        } else {
            self.curve
        };

        let load_factor = (value - self.warn) / (self.emergency - self.warn);
        // exponential decay throttling: 1 - e^(-curve * load_factor)
        1.0 - (-curve * load_factor).exp()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackpressureConfig {
    #[serde(default)]
    pub enable_backpressure: bool,

    /// Base URL of the metrics endpoint answering instant queries.
    #[serde(default)]
    pub monitoring_url: String,

    #[serde(default)]
    pub signals: Vec<SignalSpec>,

    #[serde(default)]
    pub congestion_window_min: usize,

    #[serde(default)]
    pub congestion_window_max: usize,

    /// Let queries over recent data skip admission control entirely.
    #[serde(default)]
    pub enable_low_cost_bypass: bool,
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_backpressure {
            return Ok(());
        }

        ensure!(!self.signals.is_empty(), SignalRequiredSnafu);
        for signal in &self.signals {
            signal.validate()?;
        }

        let scheme = Url::parse(&self.monitoring_url)
            .map(|url| url.scheme().to_owned())
            .unwrap_or_default();
        ensure!(
            scheme == "http" || scheme == "https",
            InvalidMonitorUrlSnafu {
                url: self.monitoring_url.clone(),
            }
        );

        ensure!(
            self.congestion_window_min >= 1,
            CongestionWindowMinBelowOneSnafu
        );
        ensure!(
            self.congestion_window_max >= self.congestion_window_min,
            CongestionWindowMaxBelowMinSnafu
        );
        Ok(())
    }
}

/// Errors from a single signal poll. Polls never kill their task; failures
/// are logged and counted while the previous throttle value stays in force.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PollError {
    #[snafu(display("failed to build signal request: {}", source))]
    BuildSignalRequest { source: http::Error },
    #[snafu(display("signal query timed out"))]
    QueryTimeout,
    #[snafu(display("failed to execute signal query: {}", source))]
    ExecuteQuery { source: crate::http::HttpError },
    #[snafu(display("unexpected status code: {}", status))]
    UnexpectedStatus { status: http::StatusCode },
    #[snafu(display("failed to read signal response: {}", source))]
    ReadSignalBody { source: hyper::Error },
    #[snafu(display("failed to decode signal response: {}", source))]
    DecodeSignalResponse { source: serde_json::Error },
    #[snafu(display("signal query must return exactly one value, found {}", count))]
    NotSingleValue { count: usize },
    #[snafu(display("signal value is not a float: {}", value))]
    NotAFloat { value: String },
    #[snafu(display("signal query must have non-negative value: {}", value))]
    NegativeValue { value: f64 },
}

#[derive(Debug, Deserialize)]
struct InstantQueryResponse {
    #[serde(default)]
    data: InstantQueryData,
}

#[derive(Debug, Default, Deserialize)]
struct InstantQueryData {
    #[serde(default)]
    result: Vec<InstantQuerySample>,
}

#[derive(Debug, Deserialize)]
struct InstantQuerySample {
    value: (f64, String),
}

#[derive(Debug)]
struct Window {
    watermark: usize,
    active: usize,
    allowance: f64,
}

/// Shared congestion-window state. Clones share the same window, so the
/// permit handed out by [`Controller::admit`] can release from any task.
#[derive(Clone, Debug)]
pub(crate) struct Controller {
    min: usize,
    max: usize,
    window: Arc<Mutex<Window>>,
    throttles: Arc<RwLock<Vec<f64>>>,
}

impl Controller {
    fn new(min: usize, max: usize, signal_count: usize) -> Self {
        Controller {
            min,
            max,
            window: Arc::new(Mutex::new(Window {
                watermark: min,
                active: 0,
                allowance: 1.0,
            })),
            throttles: Arc::new(RwLock::new(vec![0.0; signal_count])),
        }
    }

    /// Admission is strictly first-come-first-served at the lock; there is
    /// no queueing. The returned permit releases on drop, so a slot is given
    /// back whether the downstream call succeeds, fails, or is canceled.
    fn admit(&self) -> Result<AdmissionPermit, ProxyError> {
        let mut window = self.window.lock().expect("controller mutex is poisoned");
        if window.active >= window.watermark {
            return Err(ProxyError::backpressure_backoff());
        }
        window.active += 1;
        Ok(AdmissionPermit {
            controller: self.clone(),
        })
    }

    fn release(&self) {
        let watermark = {
            let mut window = self.window.lock().expect("controller mutex is poisoned");
            window.active = window.active.saturating_sub(1);
            window.watermark += 1;
            self.constrain(&mut window);
            window.watermark
        };
        emit!(CongestionWatermarkChanged { watermark });
    }

    /// Pins the watermark inside `[min, floor(max * allowance)]`, falling
    /// back to `min` when the allowance bound dips below it.
    fn constrain(&self, window: &mut Window) {
        let bound = (self.max as f64 * window.allowance) as usize;
        window.watermark = window.watermark.min(bound).max(self.min);
    }

    /// Stores one signal's throttle and folds the map into a fresh
    /// allowance. The scan runs outside the window mutex: each signal's
    /// contribution is independent, so a relaxed snapshot still yields a
    /// valid aggregate.
    fn record_throttle(&self, index: usize, throttle: f64) {
        {
            let mut throttles = self.throttles.write().expect("throttle map is poisoned");
            throttles[index] = throttle;
        }

        let peak = self
            .throttles
            .read()
            .expect("throttle map is poisoned")
            .iter()
            .copied()
            .fold(0.0, f64::max);

        let (allowance, watermark) = {
            let mut window = self.window.lock().expect("controller mutex is poisoned");
            window.allowance = 1.0 - peak;
            self.constrain(&mut window);
            (window.allowance, window.watermark)
        };
        emit!(CongestionControlUpdated {
            allowance,
            watermark
        });
    }

    #[cfg(test)]
    fn watermark(&self) -> usize {
        self.window.lock().unwrap().watermark
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.window.lock().unwrap().active
    }

    #[cfg(test)]
    fn allowance(&self) -> f64 {
        self.window.lock().unwrap().allowance
    }

    #[cfg(test)]
    fn set_window(&self, watermark: usize, active: usize, allowance: f64) {
        let mut window = self.window.lock().unwrap();
        window.watermark = watermark;
        window.active = active;
        window.allowance = allowance;
    }
}

#[derive(Debug)]
pub(crate) struct AdmissionPermit {
    controller: Controller,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// The AIMD admission stage. `init` spawns one poller task per signal;
/// `next` gates every request on the congestion window unless the low-cost
/// bypass classifies it as recent.
pub struct Backpressure {
    controller: Controller,
    signals: Vec<SignalSpec>,
    monitoring_url: String,
    client: HttpClient,
    bypass: bool,
    next: Arc<dyn Middleware>,
}

impl Backpressure {
    pub fn new(next: Arc<dyn Middleware>, config: &BackpressureConfig, client: HttpClient) -> Self {
        Backpressure {
            controller: Controller::new(
                config.congestion_window_min,
                config.congestion_window_max,
                config.signals.len(),
            ),
            signals: config.signals.clone(),
            monitoring_url: config.monitoring_url.trim_end_matches('/').to_owned(),
            client,
            bypass: config.enable_low_cost_bypass,
            next,
        }
    }
}

#[async_trait]
impl Middleware for Backpressure {
    async fn init(&self, shutdown: CancellationToken) {
        emit!(CongestionWindowLimits {
            min: self.controller.min,
            max: self.controller.max,
        });
        emit!(CongestionControlUpdated {
            allowance: 1.0,
            watermark: self.controller.min,
        });

        for (index, signal) in self.signals.iter().enumerate() {
            if let Some(name) = &signal.name {
                emit!(SignalThresholds {
                    name: name.as_str(),
                    warn: signal.warn,
                    emergency: signal.emergency,
                });
            }

            tokio::spawn(poll_signal(
                self.controller.clone(),
                self.client.clone(),
                self.monitoring_url.clone(),
                signal.clone(),
                index,
                SIGNAL_POLL_CADENCE,
                shutdown.clone(),
            ));
        }

        self.next.init(shutdown).await;
    }

    async fn next(&self, mut exchange: Exchange) -> Result<Exchange, ProxyError> {
        if self.bypass && query_cost::classify(&mut exchange).await? == QueryCost::Low {
            return self.next.next(exchange).await;
        }

        let _permit = self.controller.admit()?;
        self.next.next(exchange).await
    }
}

/// One poller per signal so a slow query cannot keep the other signals from
/// actioning the congestion window.
async fn poll_signal(
    controller: Controller,
    client: HttpClient,
    monitoring_url: String,
    signal: SignalSpec,
    index: usize,
    cadence: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + cadence;
    let mut ticker = tokio::time::interval_at(start, cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match sample_signal(&client, &monitoring_url, &signal.query).await {
            Ok(value) => {
                emit!(SignalValueUpdated {
                    name: signal.name.as_deref(),
                    query: &signal.query,
                    value,
                });
                controller.record_throttle(index, signal.throttle_percent(value));
            }
            Err(error) => {
                emit!(SignalPollError {
                    name: signal.name.as_deref(),
                    query: &signal.query,
                    error: &error,
                });
            }
        }
    }
}

/// Issues one instant query and reads back its scalar.
async fn sample_signal(
    client: &HttpClient,
    monitoring_url: &str,
    query: &str,
) -> Result<f64, PollError> {
    let encoded = form_urlencoded::Serializer::new(String::new())
        .append_pair("query", query)
        .finish();
    let uri = format!(
        "{}{}?{}",
        monitoring_url,
        query_cost::INSTANT_QUERY_PATH,
        encoded
    );
    let request = Request::get(uri.as_str())
        .body(Body::empty())
        .context(BuildSignalRequestSnafu)?;

    let response = tokio::time::timeout(MONITOR_QUERY_TIMEOUT, client.send(request))
        .await
        .map_err(|_| PollError::QueryTimeout)?
        .context(ExecuteQuerySnafu)?;

    ensure!(
        response.status() == http::StatusCode::OK,
        UnexpectedStatusSnafu {
            status: response.status(),
        }
    );

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .context(ReadSignalBodySnafu)?;
    let decoded: InstantQueryResponse =
        serde_json::from_slice(&body).context(DecodeSignalResponseSnafu)?;

    let results = decoded.data.result;
    ensure!(
        results.len() == 1,
        NotSingleValueSnafu {
            count: results.len(),
        }
    );

    let (_, raw) = &results[0].value;
    let value: f64 = raw
        .parse()
        .ok()
        .context(NotAFloatSnafu { value: raw.clone() })?;
    ensure!(value >= 0.0, NegativeValueSnafu { value });
    Ok(value)
}
