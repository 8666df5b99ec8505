//! # webimage-dl
//!
//! Asynchronous web-image downloading and caching library with request
//! coalescing.
//!
//! ## Design Philosophy
//!
//! webimage-dl is designed to be:
//! - **Load once, reuse everywhere** - Concurrent requests for the same
//!   resource share one network fetch
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Pluggable at the seams** - Cache store and transport are traits;
//!   swap either without touching the coordination core
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use url::Url;
//! use webimage_dl::{ImageManager, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ImageManager::shared();
//!     let url = Url::parse("https://example.com/logo.png")?;
//!
//!     let handle = manager
//!         .load(
//!             &url,
//!             RequestOptions::default(),
//!             None,
//!             Some(Arc::new(|response| {
//!                 if response.finished {
//!                     match (&response.data, &response.error) {
//!                         (Some(data), _) => println!("loaded {} bytes", data.len()),
//!                         (None, Some(error)) => eprintln!("load failed: {error}"),
//!                         (None, None) => println!("nothing to load"),
//!                     }
//!                 }
//!             })),
//!         )
//!         .await?;
//!
//!     // The handle cancels only this subscription; other callers keep
//!     // sharing the same download.
//!     let _ = handle;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Cache store boundary
pub mod cache;
/// Configuration types
pub mod config;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Request coalescing and cache coordination
pub mod manager;
/// Network transport boundary
pub mod transport;
/// Core types and callbacks
pub mod types;

// Re-export commonly used types
pub use cache::{CacheStore, CachedImage, MemoryCacheStore};
pub use config::{DownloaderConfig, ExecutionOrder};
pub use downloader::{ImageDownloader, RequestHandle};
pub use error::{Error, Result};
pub use manager::ImageManager;
pub use transport::{FetchRequest, FetchResponse, HttpTransport, Transport};
pub use types::{
    CacheKeyFilterFn, CacheSource, CompletionFn, HeadersFilterFn, LoadResponse, Priority,
    ProgressFn, RequestOptions, ShouldDownloadFn, TransformFn,
};
