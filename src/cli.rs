use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    config::{AppConfig, ProxyConfig},
    middleware::{BackpressureConfig, BlockerConfig, SignalSpec},
};

#[derive(Debug, Parser)]
#[command(name = "throttle-proxy", version, about = "Adaptive request-admission proxy")]
pub struct Opts {
    /// YAML config file. When set, every other flag is ignored.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Address the proxy HTTP server listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub insecure_listen_address: String,

    /// Address serving /metrics and /healthz.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub internal_listen_address: String,

    /// Upstream URL to proxy to.
    #[arg(long, default_value = "")]
    pub upstream: String,

    /// Path routed through the middleware chain; repeatable.
    #[arg(long = "proxy-path")]
    pub proxy_paths: Vec<String>,

    /// Path forwarded upstream untouched; repeatable.
    #[arg(long = "passthrough-path")]
    pub passthrough_paths: Vec<String>,

    #[arg(long)]
    pub enable_observer: bool,

    #[arg(long)]
    pub enable_jitter: bool,

    /// Upper bound of the jitter delay, in seconds.
    #[arg(long, default_value_t = 0.0)]
    pub jitter_delay: f64,

    /// Honor the X-Request-Criticality header when jittering.
    #[arg(long)]
    pub enable_criticality: bool,

    /// Per-request deadline in seconds; zero disables it.
    #[arg(long, default_value_t = 0.0)]
    pub client_timeout: f64,

    #[arg(long)]
    pub enable_blocker: bool,

    /// Header pattern to reject, `<header>=<regex>`; repeatable.
    #[arg(long = "block-pattern")]
    pub block_patterns: Vec<String>,

    #[arg(long)]
    pub enable_backpressure: bool,

    /// Base URL of the metrics endpoint answering instant queries.
    #[arg(long, default_value = "")]
    pub backpressure_monitoring_url: String,

    /// Signal query; repeatable, paired positionally with the threshold
    /// flags.
    #[arg(long = "backpressure-query")]
    pub backpressure_queries: Vec<String>,

    /// Optional signal name; repeatable, empty suppresses per-signal
    /// metrics.
    #[arg(long = "backpressure-query-name")]
    pub backpressure_query_names: Vec<String>,

    /// Load value at which throttling begins; repeatable.
    #[arg(long = "backpressure-warn-threshold")]
    pub backpressure_warn_thresholds: Vec<f64>,

    /// Load value at which the maximum share of requests is shed;
    /// repeatable.
    #[arg(long = "backpressure-emergency-threshold")]
    pub backpressure_emergency_thresholds: Vec<f64>,

    /// Throttling aggressiveness; repeatable, zero picks the default curve.
    #[arg(long = "backpressure-throttle-curve")]
    pub backpressure_throttle_curves: Vec<f64>,

    #[arg(long, default_value_t = 0)]
    pub congestion_window_min: usize,

    #[arg(long, default_value_t = 0)]
    pub congestion_window_max: usize,

    #[arg(long)]
    pub enable_low_cost_bypass: bool,
}

impl Opts {
    /// The effective configuration: the config file when given, otherwise
    /// one assembled from the flags.
    pub fn load_config(&self) -> crate::Result<AppConfig> {
        if let Some(path) = &self.config_file {
            return Ok(AppConfig::from_file(path)?);
        }

        let mut config = AppConfig {
            listen_addr: self.insecure_listen_address.clone(),
            internal_addr: self.internal_listen_address.clone(),
            upstream: self.upstream.clone(),
            proxy_paths: self.proxy_paths.clone(),
            passthrough_paths: self.passthrough_paths.clone(),
            proxy: ProxyConfig {
                backpressure: BackpressureConfig {
                    enable_backpressure: self.enable_backpressure,
                    monitoring_url: self.backpressure_monitoring_url.clone(),
                    signals: self.signals()?,
                    congestion_window_min: self.congestion_window_min,
                    congestion_window_max: self.congestion_window_max,
                    enable_low_cost_bypass: self.enable_low_cost_bypass,
                },
                blocker: BlockerConfig {
                    enable_blocker: self.enable_blocker,
                    block_patterns: self.block_patterns.clone(),
                },
                enable_jitter: self.enable_jitter,
                jitter_delay: seconds(self.jitter_delay)?,
                enable_criticality: self.enable_criticality,
                enable_observer: self.enable_observer,
                client_timeout: match self.client_timeout {
                    timeout if timeout > 0.0 => Some(seconds(timeout)?),
                    _ => None,
                },
            },
        };

        if config.proxy_paths.is_empty() {
            config.proxy_paths = AppConfig::default_proxy_paths();
        }
        Ok(config)
    }

    /// Zips the parallel signal flags into specs. Names and curves may be
    /// omitted entirely; the thresholds must pair up with the queries.
    fn signals(&self) -> crate::Result<Vec<SignalSpec>> {
        let count = self.backpressure_queries.len();
        if self.backpressure_warn_thresholds.len() != count
            || self.backpressure_emergency_thresholds.len() != count
        {
            return Err("each backpressure query needs a warn and an emergency threshold".into());
        }
        if !self.backpressure_query_names.is_empty() && self.backpressure_query_names.len() != count
        {
            return Err("backpressure query names must pair up with the queries".into());
        }
        if !self.backpressure_throttle_curves.is_empty()
            && self.backpressure_throttle_curves.len() != count
        {
            return Err("backpressure throttle curves must pair up with the queries".into());
        }

        Ok(self
            .backpressure_queries
            .iter()
            .enumerate()
            .map(|(index, query)| SignalSpec {
                name: self
                    .backpressure_query_names
                    .get(index)
                    .filter(|name| !name.is_empty())
                    .cloned(),
                query: query.clone(),
                warn: self.backpressure_warn_thresholds[index],
                emergency: self.backpressure_emergency_thresholds[index],
                curve: match self.backpressure_throttle_curves.get(index) {
                    Some(curve) if *curve > 0.0 => *curve,
                    _ => crate::middleware::backpressure::DEFAULT_THROTTLE_CURVE,
                },
            })
            .collect())
    }
}

fn seconds(value: f64) -> crate::Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration of {} seconds", value).into());
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_assemble_a_config() {
        let opts = Opts::parse_from([
            "throttle-proxy",
            "--upstream",
            "http://prometheus:9090",
            "--enable-observer",
            "--enable-jitter",
            "--jitter-delay",
            "0.5",
            "--enable-backpressure",
            "--backpressure-monitoring-url",
            "http://thanos:9090",
            "--backpressure-query",
            "sum(throughput)",
            "--backpressure-warn-threshold",
            "10",
            "--backpressure-emergency-threshold",
            "100",
            "--congestion-window-min",
            "2",
            "--congestion-window-max",
            "100",
        ]);

        let config = opts.load_config().unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.jitter_delay, Duration::from_millis(500));
        assert_eq!(
            config.proxy_paths,
            vec!["/api/v1/query".to_owned(), "/api/v1/query_range".to_owned()]
        );

        let signal = &config.proxy.backpressure.signals[0];
        assert_eq!(signal.query, "sum(throughput)");
        assert_eq!(signal.name, None);
        assert_eq!(signal.curve, 4.0);
    }

    #[test]
    fn mismatched_signal_flags_are_rejected() {
        let opts = Opts::parse_from([
            "throttle-proxy",
            "--upstream",
            "http://prometheus:9090",
            "--backpressure-query",
            "sum(throughput)",
            "--backpressure-warn-threshold",
            "10",
        ]);

        let error = opts.load_config().unwrap_err();
        assert!(error.to_string().contains("emergency threshold"));
    }
}
