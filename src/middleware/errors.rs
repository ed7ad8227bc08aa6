use std::fmt;

use snafu::Snafu;

use crate::http::HttpError;

/// Which stage refused the request. Blocks are tagged so operators can tell
/// pattern matches apart from congestion backoff in the `block_count` metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockSource {
    Backpressure,
    Blocker,
}

impl BlockSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            BlockSource::Backpressure => "backpressure",
            BlockSource::Blocker => "blocker",
        }
    }
}

impl fmt::Display for BlockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the middleware chain. `Blocked` is the only kind the
/// entry points render as HTTP 429; everything else maps to 500.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProxyError {
    #[snafu(display("{}", reason))]
    Blocked {
        #[snafu(source(false))]
        source: BlockSource,
        reason: String,
    },

    #[snafu(display("request canceled"))]
    Canceled,

    #[snafu(display("panic calling Next: {}", detail))]
    NextPanic { detail: String },

    #[snafu(display("cannot parse {:?} to a valid duration", value))]
    InvalidDuration { value: String },

    #[snafu(display("cannot parse {:?} to a valid timestamp", value))]
    InvalidTimestamp { value: String },

    #[snafu(display("can only estimate instant or range queries, found {}", path))]
    UnsupportedQueryPath { path: String },

    #[snafu(display("failed to read request body: {}", source))]
    ReadBody { source: hyper::Error },

    #[snafu(display("upstream round trip failed: {}", source))]
    Upstream { source: HttpError },

    #[snafu(display("proxy handler failed: {}", source))]
    Handler { source: crate::Error },

    #[snafu(display("terminal stage did not record a response"))]
    MissingResponse,
}

impl ProxyError {
    pub fn blocked(source: BlockSource, reason: impl Into<String>) -> Self {
        ProxyError::Blocked {
            source,
            reason: reason.into(),
        }
    }

    pub fn backpressure_backoff() -> Self {
        Self::blocked(
            BlockSource::Backpressure,
            "congestion window closed, backoff from backpressure",
        )
    }

    pub const fn block_source(&self) -> Option<BlockSource> {
        match self {
            ProxyError::Blocked { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub const fn is_blocked(&self) -> bool {
        self.block_source().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_source_round_trips_through_display() {
        let error = ProxyError::blocked(BlockSource::Blocker, "header X blocked");
        assert_eq!(error.block_source(), Some(BlockSource::Blocker));
        assert_eq!(error.to_string(), "header X blocked");
    }

    #[test]
    fn backoff_is_blocked() {
        let error = ProxyError::backpressure_backoff();
        assert!(error.is_blocked());
        assert_eq!(error.block_source(), Some(BlockSource::Backpressure));
    }

    #[test]
    fn panic_message_carries_detail() {
        let error = ProxyError::NextPanic {
            detail: "here".into(),
        };
        assert_eq!(error.to_string(), "panic calling Next: here");
    }
}
