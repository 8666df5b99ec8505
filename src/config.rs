//! Configuration types for webimage-dl

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Order in which same-priority pending downloads are admitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// First in, first out — submission order (default)
    #[default]
    Fifo,
    /// Last in, first out — reverse submission order
    Lifo,
}

/// Configuration for [`ImageDownloader`](crate::downloader::ImageDownloader)
///
/// Every field has a sensible default; `max_concurrent_downloads`,
/// `download_timeout`, and `execution_order` can also be changed at runtime
/// through the downloader's setters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Maximum number of downloads executing at once (default: 6)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Timeout for a single download operation (default: 15 seconds)
    #[serde(default = "default_download_timeout")]
    pub download_timeout: Duration,

    /// Admission order among same-priority pending downloads
    #[serde(default)]
    pub execution_order: ExecutionOrder,

    /// Headers attached to every download request
    ///
    /// Defaults to an image `Accept` header. Individual headers can be
    /// added or removed later with
    /// [`set_http_header`](crate::downloader::ImageDownloader::set_http_header).
    #[serde(default = "default_headers")]
    pub default_headers: HashMap<String, String>,

    /// `User-Agent` sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Username for HTTP Basic authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for HTTP Basic authentication
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent(),
            download_timeout: default_download_timeout(),
            execution_order: ExecutionOrder::default(),
            default_headers: default_headers(),
            user_agent: default_user_agent(),
            username: None,
            password: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    6
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_headers() -> HashMap<String, String> {
    HashMap::from([("accept".to_string(), "image/*;q=0.8".to_string())])
}

fn default_user_agent() -> String {
    format!("webimage-dl/{}", env!("CARGO_PKG_VERSION"))
}
