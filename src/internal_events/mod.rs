//! Structured events emitted by the proxy. Each event carries its own log
//! line and metric updates so call sites stay free of telemetry plumbing.

mod backpressure;
mod http_client;
mod proxy;

pub use self::backpressure::{
    CongestionControlUpdated, CongestionWatermarkChanged, CongestionWindowLimits, SignalPollError,
    SignalThresholds, SignalValueUpdated,
};
pub use self::http_client::{AboutToSendHttpRequest, GotHttpError, GotHttpResponse};
pub use self::proxy::{
    ProxyRequestBlocked, ProxyRequestCompleted, ProxyRequestFailed, ProxyRequestReceived,
};

pub trait InternalEvent {
    fn emit_logs(&self) {}
    fn emit_metrics(&self) {}
}

pub fn emit(event: &impl InternalEvent) {
    event.emit_logs();
    event.emit_metrics();
}

#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::emit(&$event)
    };
}
