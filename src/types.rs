//! Core types for webimage-dl

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::error::{Error, Result};

/// Scheduling tier for a download
///
/// High-priority downloads are always admitted ahead of normal and low
/// pending work; low-priority downloads are placed behind all normal
/// pending work. Ties within a tier follow the configured
/// [`ExecutionOrder`](crate::config::ExecutionOrder).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
}

/// Where a delivered image came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Served from the in-memory cache
    Memory,
    /// Served from the on-disk cache
    Disk,
    /// Fetched over the network
    Network,
}

/// Options attached to a single load/download request
///
/// This is a structured redesign of a bitmask options word: every flag is a
/// named boolean, all composable except where [`validate`](Self::validate)
/// says otherwise. All flags default to `false`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Schedule this download behind all normal-priority pending work
    #[serde(default)]
    pub low_priority: bool,

    /// Promote this download ahead of all pending work
    #[serde(default)]
    pub high_priority: bool,

    /// Deliver partial content as bytes arrive (`finished = false`
    /// completions with a growing payload prefix)
    #[serde(default)]
    pub progressive: bool,

    /// Honor the transport's own HTTP caching instead of bypassing it
    #[serde(default)]
    pub use_protocol_cache: bool,

    /// Treat a protocol-cache revalidation hit as an empty result
    #[serde(default)]
    pub ignore_cached_response: bool,

    /// Accept untrusted TLS certificates (testing only)
    #[serde(default)]
    pub allow_insecure_tls: bool,

    /// Send and store cookies for this request
    #[serde(default)]
    pub handle_cookies: bool,

    /// Bypass the failure blacklist and attempt the fetch anyway
    #[serde(default)]
    pub retry_failed: bool,

    /// Serve a cached hit immediately (`finished = false`), then still
    /// revalidate over the network and deliver the final result
    #[serde(default)]
    pub refresh_cached: bool,

    /// Cache the result in memory only, skipping the disk tier
    #[serde(default)]
    pub cache_memory_only: bool,

    /// Skip the post-fetch transform hook; the caller takes responsibility
    /// for applying the raw result
    #[serde(default)]
    pub avoid_auto_apply: bool,

    /// Keep the fetch alive even after the last subscriber cancels; the
    /// result still lands in the cache
    #[serde(default)]
    pub background_continuation: bool,
}

impl RequestOptions {
    /// Reject forbidden flag combinations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] when `low_priority` and
    /// `high_priority` are both set.
    pub fn validate(&self) -> Result<()> {
        if self.low_priority && self.high_priority {
            return Err(Error::InvalidOptions(
                "low_priority and high_priority are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// The scheduling tier derived from the priority flags.
    pub fn priority(&self) -> Priority {
        if self.high_priority {
            Priority::High
        } else if self.low_priority {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

/// Payload delivered to a completion callback
///
/// `finished = true` with `Some(error)` and no data signals terminal
/// failure; `finished = false` carries partial or stale-cached content and
/// is always followed by exactly one terminal call.
#[derive(Clone, Debug)]
pub struct LoadResponse {
    /// The URL the request was issued for
    pub url: Url,
    /// The (possibly partial) payload, if any
    pub data: Option<Bytes>,
    /// The failure, if any
    pub error: Option<Arc<Error>>,
    /// Where the payload came from; `None` when there is no payload
    pub source: Option<CacheSource>,
    /// Whether this is the terminal callback for the subscriber
    pub finished: bool,
}

/// Progress callback: `(received_bytes, expected_bytes)`
///
/// Invoked on the delivery context every time new bytes arrive, and once
/// with `(0, expected)` when the response headers are known.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Completion callback, invoked on the delivery context
pub type CompletionFn = Arc<dyn Fn(LoadResponse) + Send + Sync>;

/// Hook transforming a downloaded payload before caching and fan-out
pub type TransformFn = Arc<dyn Fn(Bytes, &Url) -> Bytes + Send + Sync>;

/// Hook deriving a cache key from a request URL
pub type CacheKeyFilterFn = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Hook vetoing downloads for specific URLs (`false` = do not download)
pub type ShouldDownloadFn = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Hook rewriting the HTTP headers sent with a download request
pub type HeadersFilterFn =
    Arc<dyn Fn(&Url, reqwest::header::HeaderMap) -> reqwest::header::HeaderMap + Send + Sync>;
