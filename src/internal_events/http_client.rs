use std::time::Duration;

use http::{Request, Response};
use metrics::{counter, histogram};

use super::InternalEvent;

#[derive(Debug)]
pub struct AboutToSendHttpRequest<'a, T> {
    pub request: &'a Request<T>,
}

impl<'a, T> InternalEvent for AboutToSendHttpRequest<'a, T> {
    fn emit_logs(&self) {
        debug!(
            message = "Sending HTTP request.",
            uri = %self.request.uri(),
            method = %self.request.method(),
        );
    }

    fn emit_metrics(&self) {
        counter!(
            "http_client_requests_sent_total", 1,
            "method" => self.request.method().to_string(),
        );
    }
}

#[derive(Debug)]
pub struct GotHttpResponse<'a, T> {
    pub response: &'a Response<T>,
    pub roundtrip: Duration,
}

impl<'a, T> InternalEvent for GotHttpResponse<'a, T> {
    fn emit_logs(&self) {
        debug!(
            message = "HTTP response received.",
            status = %self.response.status(),
            roundtrip = ?self.roundtrip,
        );
    }

    fn emit_metrics(&self) {
        counter!(
            "http_client_responses_total", 1,
            "status" => self.response.status().to_string(),
        );
        histogram!("http_client_rtt_seconds", self.roundtrip);
    }
}

#[derive(Debug)]
pub struct GotHttpError<'a> {
    pub error: &'a hyper::Error,
    pub roundtrip: Duration,
}

impl<'a> InternalEvent for GotHttpError<'a> {
    fn emit_logs(&self) {
        warn!(message = "HTTP request failed.", error = %self.error, roundtrip = ?self.roundtrip);
    }

    fn emit_metrics(&self) {
        counter!("http_client_errors_total", 1);
    }
}
