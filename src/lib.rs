//! Adaptive request-admission middleware for fronting an upstream HTTP
//! service. Incoming requests traverse a fixed chain of middlewares whose
//! centerpiece is an AIMD congestion controller driven by externally polled
//! metric signals.

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod internal_events;

pub mod cli;
pub mod config;
pub mod http;
pub mod middleware;
pub mod routes;
#[cfg(test)]
pub mod test_util;

pub use config::{AppConfig, ProxyConfig};
pub use middleware::{Exchange, Middleware, ProxyError, ServeEntry, TransportEntry};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;

/// The user agent announced by every outbound HTTP request.
pub fn user_agent() -> String {
    format!("ThrottleProxy/{}", env!("CARGO_PKG_VERSION"))
}
