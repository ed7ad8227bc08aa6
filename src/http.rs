use std::time::Instant;

use futures::future::BoxFuture;
use http::{header::HeaderValue, Request};
use hyper::{
    client::{Client, HttpConnector},
    Body,
};
use hyper_openssl::HttpsConnector;
use snafu::{ResultExt, Snafu};

use crate::internal_events::{AboutToSendHttpRequest, GotHttpError, GotHttpResponse};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    #[snafu(display("Failed to build TLS connector: {}", source))]
    BuildTlsConnector { source: openssl::error::ErrorStack },
    #[snafu(display("Failed to make HTTP(S) request: {}", source))]
    CallRequest { source: hyper::Error },
    #[snafu(display("Failed to build HTTP request: {}", source))]
    BuildRequest { source: http::Error },
}

/// A hyper client shared by the signal pollers and the upstream forwarder.
/// Idle connections stay pooled inside the wrapped client, so cloning is
/// cheap and every clone reuses the same pool.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    user_agent: HeaderValue,
}

impl HttpClient {
    pub fn new() -> Result<HttpClient, HttpError> {
        let https = HttpsConnector::new().context(BuildTlsConnectorSnafu)?;
        let client = Client::builder().build(https);

        let user_agent = HeaderValue::from_str(&crate::user_agent())
            .expect("invalid header value for version!");

        Ok(HttpClient { client, user_agent })
    }

    pub fn send(
        &self,
        mut request: Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, HttpError>> {
        default_request_headers(&mut request, &self.user_agent);

        emit!(AboutToSendHttpRequest { request: &request });

        let response = self.client.request(request);

        Box::pin(async move {
            let before = Instant::now();
            let response_result = response.await;
            let roundtrip = before.elapsed();

            let response = response_result
                .map_err(|error| {
                    emit!(GotHttpError {
                        error: &error,
                        roundtrip
                    });
                    error
                })
                .context(CallRequestSnafu)?;

            emit!(GotHttpResponse {
                response: &response,
                roundtrip
            });
            Ok(response)
        })
    }
}

fn default_request_headers<B>(request: &mut Request<B>, user_agent: &HeaderValue) {
    if !request.headers().contains_key("User-Agent") {
        request
            .headers_mut()
            .insert("User-Agent", user_agent.clone());
    }

    if !request.headers().contains_key("Accept-Encoding") {
        request
            .headers_mut()
            .insert("Accept-Encoding", HeaderValue::from_static("identity"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers_do_not_clobber() {
        let mut request = Request::get("http://example.com/api/v1/query")
            .header("User-Agent", "custom-agent")
            .body(Body::empty())
            .unwrap();
        default_request_headers(&mut request, &HeaderValue::from_static("ThrottleProxy/0.0.0"));

        assert_eq!(request.headers()["User-Agent"], "custom-agent");
        assert_eq!(request.headers()["Accept-Encoding"], "identity");
    }

    #[test]
    fn default_headers_fill_missing() {
        let mut request = Request::get("http://example.com/healthz")
            .body(Body::empty())
            .unwrap();
        default_request_headers(&mut request, &HeaderValue::from_static("ThrottleProxy/0.0.0"));

        assert_eq!(request.headers()["User-Agent"], "ThrottleProxy/0.0.0");
    }
}
