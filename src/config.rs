//! Configuration for the proxy binary and the middleware chain. Values come
//! from a YAML file, with flags filling in when no file is given; validation
//! reports every violation at once so operators fix a config in one pass.

use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::middleware::{
    query_cost::{INSTANT_QUERY_PATH, RANGE_QUERY_PATH},
    BackpressureConfig, BlockerConfig,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("delay must be non-empty when jitter is enabled"))]
    JitterDelayRequired,

    #[snafu(display("must provide at least one signal when backpressure is enabled"))]
    SignalRequired,

    #[snafu(display("backpressure min window < 1"))]
    CongestionWindowMinBelowOne,

    #[snafu(display("backpressure max window < min window"))]
    CongestionWindowMaxBelowMin,

    #[snafu(display("throttle curve cannot be negative"))]
    NegativeThrottleCurve,

    #[snafu(display("signal thresholds cannot be negative"))]
    NegativeSignalThresholds,

    #[snafu(display("emergency threshold must be > warn threshold"))]
    EmergencyBelowWarnThreshold,

    #[snafu(display("monitoring URL {:?} must be http or https", url))]
    InvalidMonitorUrl { url: String },

    #[snafu(display("pattern {:?} did not match `<header>=<regex>`", pattern))]
    MalformedBlockPattern { pattern: String },

    #[snafu(display("header is empty for pattern {:?}", pattern))]
    EmptyBlockHeader { pattern: String },

    #[snafu(display("invalid regex in pattern {:?}: {}", pattern, source))]
    InvalidBlockRegex {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display(
        "invalid scheme for upstream URL {:?}, only 'http' and 'https' are supported",
        url
    ))]
    InvalidUpstream { url: String },

    #[snafu(display("failed to read config file {:?}: {}", path, source))]
    ReadConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {:?}: {}", path, source))]
    ParseConfigFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Every violation found in one validation pass.
#[derive(Debug)]
pub struct InvalidConfig {
    pub violations: Vec<ConfigError>,
}

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for violation in &self.violations {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", violation)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for InvalidConfig {}

/// Options recognized by the middleware chain itself.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub blocker: BlockerConfig,

    #[serde(default)]
    pub enable_jitter: bool,

    /// Upper bound of the random pre-forward delay, in seconds.
    #[serde(default)]
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub jitter_delay: Duration,

    /// Honor the `X-Request-Criticality` header when jittering.
    #[serde(default)]
    pub enable_criticality: bool,

    #[serde(default)]
    pub enable_observer: bool,

    /// Optional per-request deadline applied by the server entry, in
    /// seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    pub client_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let mut violations = Vec::new();

        if let Err(error) = self.backpressure.validate() {
            violations.push(error);
        }
        if let Err(error) = self.blocker.validate() {
            violations.push(error);
        }
        if self.enable_jitter && self.jitter_delay.is_zero() {
            violations.push(JitterDelayRequiredSnafu.build());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InvalidConfig { violations })
        }
    }
}

/// Top-level configuration of the proxy binary.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Address the proxy server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address serving operational endpoints such as `/metrics`.
    #[serde(default = "default_internal_addr")]
    pub internal_addr: String,

    /// Upstream URL requests are forwarded to.
    pub upstream: String,

    /// Paths routed through the middleware chain.
    #[serde(default = "default_proxy_paths")]
    pub proxy_paths: Vec<String>,

    /// Paths forwarded upstream untouched. Empty means every other path
    /// passes through.
    #[serde(default)]
    pub passthrough_paths: Vec<String>,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_internal_addr() -> String {
    "0.0.0.0:8081".to_owned()
}

fn default_proxy_paths() -> Vec<String> {
    vec![INSTANT_QUERY_PATH.to_owned(), RANGE_QUERY_PATH.to_owned()]
}

impl AppConfig {
    pub fn default_proxy_paths() -> Vec<String> {
        default_proxy_paths()
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).context(ReadConfigFileSnafu { path: &path })?;
        serde_yaml::from_str(&contents).context(ParseConfigFileSnafu { path: &path })
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let mut violations = match self.proxy.validate() {
            Ok(()) => Vec::new(),
            Err(invalid) => invalid.violations,
        };

        let scheme = Url::parse(&self.upstream)
            .map(|url| url.scheme().to_owned())
            .unwrap_or_default();
        if scheme != "http" && scheme != "https" {
            violations.push(
                InvalidUpstreamSnafu {
                    url: self.upstream.clone(),
                }
                .build(),
            );
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InvalidConfig { violations })
        }
    }
}
