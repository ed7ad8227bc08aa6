//! Request routing for the proxy server: a health endpoint, a set of paths
//! gated by the middleware chain, and passthrough paths forwarded upstream
//! untouched.

use std::{collections::HashSet, sync::Arc};

use hyper::{Body, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::{AppConfig, InvalidUpstreamSnafu},
    http::HttpClient,
    middleware::{RequestHandler, ServeEntry},
};

pub struct Routes {
    upstream: Url,
    client: HttpClient,
    entry: ServeEntry,
    proxy_paths: HashSet<String>,
    passthrough_paths: HashSet<String>,
}

impl Routes {
    /// Builds the route table and initializes the middleware chain,
    /// spawning its signal pollers.
    pub async fn new(config: &AppConfig, shutdown: CancellationToken) -> crate::Result<Arc<Self>> {
        let upstream = Url::parse(&config.upstream).map_err(|_| {
            InvalidUpstreamSnafu {
                url: config.upstream.clone(),
            }
            .build()
        })?;

        let client = HttpClient::new()?;

        let handler_client = client.clone();
        let handler_upstream = upstream.clone();
        let handler: RequestHandler = Arc::new(move |request| {
            let client = handler_client.clone();
            let upstream = handler_upstream.clone();
            Box::pin(async move { forward(&client, &upstream, request).await })
        });

        let entry = ServeEntry::from_config(&config.proxy, &client, handler)?;
        entry.init(shutdown).await;

        Ok(Arc::new(Routes {
            upstream,
            client,
            entry,
            proxy_paths: config.proxy_paths.iter().cloned().collect(),
            passthrough_paths: config.passthrough_paths.iter().cloned().collect(),
        }))
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path();

        if path == "/healthz" {
            return health_response();
        }

        if self.proxy_paths.contains(path) {
            return self.entry.handle(request).await;
        }

        if self.passthrough_paths.is_empty() || self.passthrough_paths.contains(path) {
            return self.passthrough(request).await;
        }

        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("not-found response builder cannot fail")
    }

    async fn passthrough(&self, request: Request<Body>) -> Response<Body> {
        match forward(&self.client, &self.upstream, request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(message = "Passthrough request failed.", %error);
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Body::empty())
                    .expect("bad-gateway response builder cannot fail")
            }
        }
    }
}

/// Rewrites the request onto the upstream authority, keeping its path and
/// query intact, then performs the round trip.
async fn forward(
    client: &HttpClient,
    upstream: &Url,
    mut request: Request<Body>,
) -> crate::Result<Response<Body>> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let authority = match upstream.port() {
        Some(port) => format!("{}:{}", upstream.host_str().unwrap_or_default(), port),
        None => upstream.host_str().unwrap_or_default().to_owned(),
    };
    let target = format!("{}://{}{}", upstream.scheme(), authority, path_and_query);
    *request.uri_mut() = target.parse()?;

    let response = client.send(request).await?;
    Ok(response)
}

fn health_response() -> Response<Body> {
    Response::builder()
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"ok":true}"#))
        .expect("health response builder cannot fail")
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr};

    use hyper::{
        service::{make_service_fn, service_fn},
        Server,
    };

    use super::*;
    use crate::config::ProxyConfig;

    /// An upstream that echoes back the request path and query.
    async fn echo_upstream() -> SocketAddr {
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|request: Request<Body>| async move {
                Ok::<_, Infallible>(Response::new(Body::from(request.uri().to_string())))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn app_config(upstream: SocketAddr, passthrough_paths: Vec<String>) -> AppConfig {
        AppConfig {
            listen_addr: "0.0.0.0:0".into(),
            internal_addr: "0.0.0.0:0".into(),
            upstream: format!("http://{}", upstream),
            proxy_paths: vec!["/api/v1/query".into(), "/api/v1/query_range".into()],
            passthrough_paths,
            proxy: ProxyConfig {
                enable_observer: true,
                ..ProxyConfig::default()
            },
        }
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_short_circuits() {
        let upstream = echo_upstream().await;
        let routes = Routes::new(&app_config(upstream, Vec::new()), CancellationToken::new())
            .await
            .unwrap();

        let response = routes
            .handle(Request::get("/healthz").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn proxy_paths_run_the_chain_and_reach_upstream() {
        let upstream = echo_upstream().await;
        let routes = Routes::new(&app_config(upstream, Vec::new()), CancellationToken::new())
            .await
            .unwrap();

        let response = routes
            .handle(
                Request::get("/api/v1/query?query=up")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "/api/v1/query?query=up");
    }

    #[tokio::test]
    async fn unlisted_paths_pass_through_by_default() {
        let upstream = echo_upstream().await;
        let routes = Routes::new(&app_config(upstream, Vec::new()), CancellationToken::new())
            .await
            .unwrap();

        let response = routes
            .handle(Request::get("/federate").body(Body::empty()).unwrap())
            .await;
        assert_eq!(body_string(response).await, "/federate");
    }

    #[tokio::test]
    async fn explicit_passthrough_list_hides_other_paths() {
        let upstream = echo_upstream().await;
        let config = app_config(upstream, vec!["/federate".into()]);
        let routes = Routes::new(&config, CancellationToken::new()).await.unwrap();

        let allowed = routes
            .handle(Request::get("/federate").body(Body::empty()).unwrap())
            .await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let hidden = routes
            .handle(Request::get("/api/v1/admin").body(Body::empty()).unwrap())
            .await;
        assert_eq!(hidden.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_bad_gateway() {
        let upstream = echo_upstream().await;
        let mut config = app_config(upstream, Vec::new());
        config.upstream = "http://127.0.0.1:1".into();
        let routes = Routes::new(&config, CancellationToken::new()).await.unwrap();

        let response = routes
            .handle(Request::get("/federate").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
