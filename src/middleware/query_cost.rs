//! Query cost estimation for the low-cost bypass. Queries that only touch
//! recent samples are classified `Low` and skip admission control: historical
//! data typically lives in colder storage, and letting recent queries through
//! keeps cheap traffic from being crowded out by expensive scans.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use hyper::Body;
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::ResultExt;
use url::form_urlencoded;

use super::{
    errors::{ProxyError, ReadBodySnafu, UnsupportedQueryPathSnafu},
    Exchange,
};

pub const INSTANT_QUERY_PATH: &str = "/api/v1/query";
pub const RANGE_QUERY_PATH: &str = "/api/v1/query_range";

/// How far back an instant selector reaches for its most recent sample.
const LOOKBACK_DELTA: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RANGE_STEP: Duration = Duration::from_secs(30);
/// Samples older than this are assumed to live in cold storage.
const COLD_STORAGE_HORIZON_HOURS: i64 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryCost {
    Low,
    High,
}

impl QueryCost {
    pub const fn is_low(self) -> bool {
        matches!(self, QueryCost::Low)
    }
}

/// Classifies the request by the earliest timestamp its query touches.
/// The request body is duplicated so later stages see it intact.
pub async fn classify(exchange: &mut Exchange) -> Result<QueryCost, ProxyError> {
    let path = exchange.request().uri().path().to_owned();
    let params = request_params(exchange).await?;
    let now = Utc::now();

    let (query, start) = match path.as_str() {
        INSTANT_QUERY_PATH => {
            let time = parse_timestamp_or(params.get("time"), now)?;
            (param(&params, "query"), time)
        }
        RANGE_QUERY_PATH => {
            let start = parse_timestamp_or(params.get("start"), now)?;
            // end and step are validated but do not move the earliest timestamp
            parse_timestamp_or(params.get("end"), now)?;
            parse_duration_or(params.get("step"), DEFAULT_RANGE_STEP)?;
            (param(&params, "query"), start)
        }
        _ => return UnsupportedQueryPathSnafu { path }.fail(),
    };

    let earliest = earliest_touched(&query, start)?;
    if earliest < now - chrono::Duration::hours(COLD_STORAGE_HORIZON_HOURS) {
        Ok(QueryCost::High)
    } else {
        Ok(QueryCost::Low)
    }
}

fn param(params: &HashMap<String, String>, key: &str) -> String {
    params.get(key).cloned().unwrap_or_default()
}

/// Collects query parameters from the URL, merged with a form-encoded body.
/// URL parameters win on duplicate keys; the body is restored afterwards.
async fn request_params(exchange: &mut Exchange) -> Result<HashMap<String, String>, ProxyError> {
    let request = exchange.request_mut();
    let mut params: HashMap<String, String> = HashMap::new();

    if let Some(query) = request.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }

    let is_form = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| {
            value.starts_with("application/x-www-form-urlencoded")
        });
    if is_form {
        let body = std::mem::replace(request.body_mut(), Body::empty());
        let bytes = hyper::body::to_bytes(body).await.context(ReadBodySnafu)?;
        for (key, value) in form_urlencoded::parse(&bytes) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        *request.body_mut() = Body::from(bytes);
    }

    Ok(params)
}

static RANGE_SELECTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([0-9][^\]]*)\]").expect("range selector regex must compile"));
static OFFSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"offset\s+([0-9][0-9a-z.]*)").expect("offset regex must compile"));

/// The earliest timestamp the query can touch, starting from its evaluation
/// start. Rather than evaluating the full expression tree, the widest range
/// selector and the largest offset are folded in together with the lookback
/// delta, which bounds the true minimum from below.
fn earliest_touched(query: &str, start: DateTime<Utc>) -> Result<DateTime<Utc>, ProxyError> {
    let mut reach = LOOKBACK_DELTA;

    let mut max_range = Duration::ZERO;
    for captures in RANGE_SELECTOR_RE.captures_iter(query) {
        let literal = &captures[1];
        // subquery selectors look like `[1h:5m]`; the range comes first
        let range = literal.split(':').next().unwrap_or(literal);
        max_range = max_range.max(parse_duration(range)?);
    }

    let mut max_offset = Duration::ZERO;
    for captures in OFFSET_RE.captures_iter(query) {
        max_offset = max_offset.max(parse_duration(&captures[1])?);
    }

    reach += max_range + max_offset;
    let reach = chrono::Duration::from_std(reach).map_err(|_| ProxyError::InvalidDuration {
        value: format!("{:?}", reach),
    })?;
    Ok(start - reach)
}

fn parse_timestamp_or(
    value: Option<&String>,
    default: DateTime<Utc>,
) -> Result<DateTime<Utc>, ProxyError> {
    match value {
        Some(value) if !value.is_empty() => parse_timestamp(value),
        _ => Ok(default),
    }
}

/// Parses float unix-seconds or an RFC3339 timestamp.
pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ProxyError> {
    if let Ok(seconds) = value.parse::<f64>() {
        let nanos = (seconds * 1e9).round();
        if nanos.is_finite() && nanos >= i64::MIN as f64 && nanos <= i64::MAX as f64 {
            return Ok(Utc.timestamp_nanos(nanos as i64));
        }
        return Err(ProxyError::InvalidTimestamp {
            value: value.to_owned(),
        });
    }

    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| ProxyError::InvalidTimestamp {
            value: value.to_owned(),
        })
}

fn parse_duration_or(value: Option<&String>, default: Duration) -> Result<Duration, ProxyError> {
    match value {
        Some(value) if !value.is_empty() => parse_duration(value),
        _ => Ok(default),
    }
}

static PROM_DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?P<y>[0-9]+)y)?(?:(?P<w>[0-9]+)w)?(?:(?P<d>[0-9]+)d)?(?:(?P<h>[0-9]+)h)?(?:(?P<m>[0-9]+)m)?(?:(?P<s>[0-9]+)s)?(?:(?P<ms>[0-9]+)ms)?$",
    )
    .expect("duration regex must compile")
});

const UNITS: [(&str, u64); 7] = [
    ("y", 365 * 24 * 60 * 60 * 1_000),
    ("w", 7 * 24 * 60 * 60 * 1_000),
    ("d", 24 * 60 * 60 * 1_000),
    ("h", 60 * 60 * 1_000),
    ("m", 60 * 1_000),
    ("s", 1_000),
    ("ms", 1),
];

/// Parses float-seconds or a Prometheus duration literal such as `5m` or
/// `1h30m`.
pub(crate) fn parse_duration(value: &str) -> Result<Duration, ProxyError> {
    let invalid = || ProxyError::InvalidDuration {
        value: value.to_owned(),
    };

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 && seconds <= u64::MAX as f64 {
            return Ok(Duration::from_secs_f64(seconds));
        }
        return Err(invalid());
    }

    let captures = PROM_DURATION_RE.captures(value).ok_or_else(invalid)?;

    let mut millis: u64 = 0;
    let mut matched = false;
    for (unit, scale) in UNITS {
        if let Some(digits) = captures.name(unit) {
            matched = true;
            let count: u64 = digits.as_str().parse().map_err(|_| invalid())?;
            millis = count
                .checked_mul(scale)
                .and_then(|add| millis.checked_add(add))
                .ok_or_else(invalid)?;
        }
    }

    if !matched {
        return Err(invalid());
    }
    Ok(Duration::from_millis(millis))
}
