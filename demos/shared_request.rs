//! Shared request example
//!
//! This example demonstrates request coalescing: several parts of an
//! application ask for the same image at the same time, yet only one
//! network fetch happens. Each caller holds its own cancel handle, and
//! cancelling one subscription leaves the others attached.
//!
//! Run with: cargo run --example shared_request

use std::sync::Arc;
use url::Url;
use webimage_dl::{ImageManager, LoadResponse, RequestOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = ImageManager::shared();
    let url = Url::parse("https://httpbin.org/image/jpeg")?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(&'static str, LoadResponse)>();

    // A thumbnail view and a detail view request the same image
    // concurrently. The second request attaches to the first one's
    // in-flight download instead of fetching again.
    let thumbnail_tx = tx.clone();
    let _thumbnail = manager
        .load(
            &url,
            RequestOptions::default(),
            None,
            Some(Arc::new(move |response| {
                let _ = thumbnail_tx.send(("thumbnail", response));
            })),
        )
        .await?;

    let detail_tx = tx.clone();
    let _detail = manager
        .load(
            &url,
            RequestOptions::default(),
            None,
            Some(Arc::new(move |response| {
                let _ = detail_tx.send(("detail", response));
            })),
        )
        .await?;

    // A third caller changes its mind right away. Its handle withdraws only
    // this subscription; the download keeps running for the other two.
    let abandoned_tx = tx.clone();
    let abandoned = manager
        .load(
            &url,
            RequestOptions::default(),
            None,
            Some(Arc::new(move |response| {
                let _ = abandoned_tx.send(("abandoned", response));
            })),
        )
        .await?;
    abandoned.cancel();
    println!("✗ Third subscriber cancelled; the shared download continues");

    drop(tx);

    let mut delivered = 0;
    while let Some((who, response)) = rx.recv().await {
        if !response.finished {
            continue;
        }
        match (&response.data, &response.error) {
            (Some(data), _) => println!("✓ {who}: received {} bytes", data.len()),
            (None, Some(error)) => eprintln!("✗ {who}: {error}"),
            (None, None) => println!("✓ {who}: empty result"),
        }
        delivered += 1;
        if delivered == 2 {
            // The cancelled subscriber never reports back.
            break;
        }
    }

    Ok(())
}
