//! Basic image loading example
//!
//! This example demonstrates the core functionality of webimage-dl:
//! - Getting the shared manager instance
//! - Loading an image with progress reporting
//! - Branching on the completion result
//!
//! Run with: cargo run --example basic_load

use std::sync::Arc;
use url::Url;
use webimage_dl::{ImageManager, LoadResponse, RequestOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let manager = ImageManager::shared();
    let url = Url::parse("https://httpbin.org/image/png")?;

    // The completion callback may fire more than once (partial content with
    // the progressive option, the stale copy with refresh_cached); the
    // terminal call is marked with `finished = true`.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<LoadResponse>();

    let _handle = manager
        .load(
            &url,
            RequestOptions::default(),
            Some(Arc::new(|received, total| match total {
                Some(total) => println!("⬇ {received}/{total} bytes"),
                None => println!("⬇ {received} bytes"),
            })),
            Some(Arc::new(move |response| {
                let _ = tx.send(response);
            })),
        )
        .await?;

    while let Some(response) = rx.recv().await {
        if !response.finished {
            continue;
        }
        match (&response.data, &response.error) {
            (Some(data), _) => {
                println!("✓ Loaded {} bytes from {:?}", data.len(), response.source);
            }
            (None, Some(error)) => eprintln!("✗ Load failed: {error}"),
            (None, None) => println!("Nothing to load (vetoed or unchanged)"),
        }
        break;
    }

    // A repeat load is served straight from the cache: the completion fires
    // once with `finished = true` and no network request is made.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<LoadResponse>();
    manager
        .load(
            &url,
            RequestOptions::default(),
            None,
            Some(Arc::new(move |response| {
                let _ = tx.send(response);
            })),
        )
        .await?;
    if let Some(response) = rx.recv().await {
        println!(
            "✓ Second load served from {:?} ({} bytes)",
            response.source,
            response.data.map(|data| data.len()).unwrap_or(0)
        );
    }

    Ok(())
}
