use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tokio_util::sync::CancellationToken;

use super::{
    errors::{BlockSource, ProxyError},
    Exchange, Middleware,
};
use crate::config::{
    ConfigError, EmptyBlockHeaderSnafu, InvalidBlockRegexSnafu, MalformedBlockPatternSnafu,
};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BlockerConfig {
    #[serde(default)]
    pub enable_blocker: bool,

    /// Header patterns to reject, each of the form `<header>=<regex>`.
    /// Ex. `X-User-Agent=service-to-block.*`
    #[serde(default)]
    pub block_patterns: Vec<String>,
}

impl BlockerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.block_patterns {
            BlockPattern::parse(pattern)?;
        }
        Ok(())
    }
}

/// One compiled `<header>=<regex>` rule.
#[derive(Clone, Debug)]
pub struct BlockPattern {
    header: String,
    regex: Regex,
}

impl BlockPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let (header, regex) = pattern
            .split_once('=')
            .ok_or_else(|| MalformedBlockPatternSnafu { pattern }.build())?;
        ensure!(!header.is_empty(), EmptyBlockHeaderSnafu { pattern });

        let regex = Regex::new(regex).context(InvalidBlockRegexSnafu { pattern })?;
        Ok(BlockPattern {
            header: header.to_owned(),
            regex,
        })
    }
}

/// Rejects any request carrying a header value that matches a configured
/// pattern. A match anywhere blocks; iteration order is irrelevant.
pub struct Blocker {
    patterns: Vec<BlockPattern>,
    next: Arc<dyn Middleware>,
}

impl Blocker {
    pub fn new(next: Arc<dyn Middleware>, config: &BlockerConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .block_patterns
            .iter()
            .map(|pattern| BlockPattern::parse(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Blocker { patterns, next })
    }
}

#[async_trait]
impl Middleware for Blocker {
    async fn init(&self, shutdown: CancellationToken) {
        self.next.init(shutdown).await;
    }

    async fn next(&self, exchange: Exchange) -> Result<Exchange, ProxyError> {
        let headers = exchange.request().headers();
        for pattern in &self.patterns {
            for value in headers.get_all(pattern.header.as_str()) {
                let value = String::from_utf8_lossy(value.as_bytes());
                if pattern.regex.is_match(&value) {
                    return Err(ProxyError::blocked(
                        BlockSource::Blocker,
                        format!(
                            "header {}, value {} blocked by regex {}",
                            pattern.header, value, pattern.regex
                        ),
                    ));
                }
            }
        }
        self.next.next(exchange).await
    }
}
