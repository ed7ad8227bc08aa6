use metrics::{counter, gauge};

use super::InternalEvent;
use crate::middleware::backpressure::PollError;

#[derive(Debug)]
pub struct CongestionWindowLimits {
    pub min: usize,
    pub max: usize,
}

impl InternalEvent for CongestionWindowLimits {
    fn emit_logs(&self) {
        debug!(message = "Congestion window configured.", min = %self.min, max = %self.max);
    }

    fn emit_metrics(&self) {
        gauge!("cwdn_min", self.min as f64);
        gauge!("cwdn_max", self.max as f64);
    }
}

#[derive(Debug)]
pub struct CongestionControlUpdated {
    pub allowance: f64,
    pub watermark: usize,
}

impl InternalEvent for CongestionControlUpdated {
    fn emit_logs(&self) {
        debug!(
            message = "Allowance updated.",
            allowance = %self.allowance,
            watermark = %self.watermark,
        );
    }

    fn emit_metrics(&self) {
        gauge!("allowance", self.allowance);
        gauge!("watermark", self.watermark as f64);
    }
}

/// Emitted on every release; kept log-free since releases are the hot path.
#[derive(Debug)]
pub struct CongestionWatermarkChanged {
    pub watermark: usize,
}

impl InternalEvent for CongestionWatermarkChanged {
    fn emit_metrics(&self) {
        gauge!("watermark", self.watermark as f64);
    }
}

#[derive(Debug)]
pub struct SignalThresholds<'a> {
    pub name: &'a str,
    pub warn: f64,
    pub emergency: f64,
}

impl<'a> InternalEvent for SignalThresholds<'a> {
    fn emit_metrics(&self) {
        gauge!("signal_warn", self.warn, "name" => self.name.to_owned());
        gauge!("signal_emergency", self.emergency, "name" => self.name.to_owned());
    }
}

#[derive(Debug)]
pub struct SignalValueUpdated<'a> {
    pub name: Option<&'a str>,
    pub query: &'a str,
    pub value: f64,
}

impl<'a> InternalEvent for SignalValueUpdated<'a> {
    fn emit_logs(&self) {
        debug!(message = "Signal sampled.", query = %self.query, value = %self.value);
    }

    fn emit_metrics(&self) {
        if let Some(name) = self.name {
            gauge!("signal_value", self.value, "name" => name.to_owned());
        }
    }
}

#[derive(Debug)]
pub struct SignalPollError<'a> {
    pub name: Option<&'a str>,
    pub query: &'a str,
    pub error: &'a PollError,
}

impl<'a> InternalEvent for SignalPollError<'a> {
    fn emit_logs(&self) {
        warn!(message = "Signal poll failed.", query = %self.query, error = %self.error);
    }

    fn emit_metrics(&self) {
        if let Some(name) = self.name {
            counter!("signal_error_count", 1, "name" => name.to_owned());
        }
    }
}
