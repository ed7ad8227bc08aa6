use std::time::Duration;

use metrics::{counter, decrement_gauge, histogram, increment_gauge};

use super::InternalEvent;
use crate::middleware::errors::{BlockSource, ProxyError};

#[derive(Debug)]
pub struct ProxyRequestReceived;

impl InternalEvent for ProxyRequestReceived {
    fn emit_metrics(&self) {
        increment_gauge!("active_requests", 1.0);
    }
}

#[derive(Debug)]
pub struct ProxyRequestCompleted {
    pub elapsed: Duration,
}

impl InternalEvent for ProxyRequestCompleted {
    fn emit_metrics(&self) {
        counter!("request_count", 1);
        histogram!("request_latency_ms", self.elapsed.as_secs_f64() * 1_000.0);
        decrement_gauge!("active_requests", 1.0);
    }
}

#[derive(Debug)]
pub struct ProxyRequestBlocked {
    pub source: BlockSource,
}

impl InternalEvent for ProxyRequestBlocked {
    fn emit_logs(&self) {
        debug!(message = "Request blocked.", source = %self.source);
    }

    fn emit_metrics(&self) {
        counter!("block_count", 1, "source" => self.source.as_str());
    }
}

#[derive(Debug)]
pub struct ProxyRequestFailed<'a> {
    pub error: &'a ProxyError,
}

impl<'a> InternalEvent for ProxyRequestFailed<'a> {
    fn emit_logs(&self) {
        warn!(message = "Request failed.", error = %self.error);
    }

    fn emit_metrics(&self) {
        counter!("error_count", 1);
    }
}
