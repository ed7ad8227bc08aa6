use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use clap::Parser;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use throttle_proxy::{cli::Opts, routes::Routes, Result};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("throttle-proxy: {}", error);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = opts.load_config()?;
    config.validate()?;

    let recorder = PrometheusBuilder::new().install_recorder()?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let routes = Routes::new(&config, shutdown.clone()).await?;

    let listen_addr: SocketAddr = config.listen_addr.parse()?;
    let internal_addr: SocketAddr = config.internal_addr.parse()?;

    let proxy_routes = Arc::clone(&routes);
    let proxy_service = make_service_fn(move |_| {
        let routes = Arc::clone(&proxy_routes);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let routes = Arc::clone(&routes);
                async move { Ok::<_, Infallible>(routes.handle(request).await) }
            }))
        }
    });

    let internal_service = make_service_fn(move |_| {
        let recorder = recorder.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                let recorder = recorder.clone();
                async move {
                    let response = match request.uri().path() {
                        "/metrics" => Response::new(Body::from(recorder.render())),
                        "/healthz" => Response::new(Body::from(r#"{"ok":true}"#)),
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::empty())
                            .expect("not-found response builder cannot fail"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let proxy_shutdown = shutdown.clone();
    let proxy_server = Server::try_bind(&listen_addr)?
        .serve(proxy_service)
        .with_graceful_shutdown(async move { proxy_shutdown.cancelled().await });

    let internal_shutdown = shutdown.clone();
    let internal_server = Server::try_bind(&internal_addr)?
        .serve(internal_service)
        .with_graceful_shutdown(async move { internal_shutdown.cancelled().await });

    info!(
        message = "Proxy listening.",
        proxy = %listen_addr,
        internal = %internal_addr,
        upstream = %config.upstream,
    );

    let (proxy_result, internal_result) = tokio::join!(proxy_server, internal_server);
    proxy_result?;
    internal_result?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("Shutdown signal received, draining.");
        shutdown.cancel();
    });
}
