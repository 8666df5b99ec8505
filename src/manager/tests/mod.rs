use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheStore, CachedImage, MemoryCacheStore};
use crate::config::DownloaderConfig;
use crate::downloader::ImageDownloader;
use crate::downloader::test_helpers::{
    MockBehavior, MockTransport, Recorder, manager_with, test_url, wait_until,
};
use crate::error::Error;
use crate::manager::ImageManager;
use crate::types::{CacheSource, RequestOptions};

/// Cache store that records every `store` call it receives.
struct RecordingCache {
    backing: MemoryCacheStore,
    stores: Mutex<Vec<(String, bool)>>,
}

impl RecordingCache {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            backing: MemoryCacheStore::new(),
            stores: Mutex::new(Vec::new()),
        })
    }

    fn stored(&self) -> Vec<(String, bool)> {
        self.stores.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheStore for RecordingCache {
    async fn lookup(&self, key: &str) -> Option<CachedImage> {
        self.backing.lookup(key).await
    }

    async fn store(&self, key: &str, data: Bytes, memory_only: bool) {
        self.stores.lock().unwrap().push((key.to_string(), memory_only));
        self.backing.store(key, data, memory_only).await;
    }

    fn contains(&self, key: &str) -> bool {
        self.backing.contains(key)
    }

    fn contains_on_disk(&self, key: &str) -> bool {
        self.backing.contains_on_disk(key)
    }
}

// --- coalescing ---

#[tokio::test]
async fn test_concurrent_requests_for_one_key_share_a_single_fetch() {
    let transport = MockTransport::gated(vec![b"shared-image"]);
    let (manager, _cache) = manager_with(transport.clone());
    let url = test_url("dedup.png");

    let first = Recorder::new();
    let second = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(first.completion()))
        .await
        .unwrap();
    manager
        .load(&url, RequestOptions::default(), None, Some(second.completion()))
        .await
        .unwrap();
    transport.release();

    let one = first.wait_terminal().await;
    let two = second.wait_terminal().await;
    assert_eq!(one.data.as_deref(), Some(b"shared-image".as_slice()));
    assert_eq!(
        one.data, two.data,
        "both requests must receive the same payload"
    );
    assert_eq!(
        transport.fetches(),
        1,
        "two requests for one cache key must coalesce into one fetch"
    );
}

#[tokio::test]
async fn test_distinct_keys_fetch_independently() {
    let transport = MockTransport::ok(vec![b"image"]);
    let (manager, _cache) = manager_with(transport.clone());

    let first = Recorder::new();
    let second = Recorder::new();
    manager
        .load(
            &test_url("one.png"),
            RequestOptions::default(),
            None,
            Some(first.completion()),
        )
        .await
        .unwrap();
    manager
        .load(
            &test_url("two.png"),
            RequestOptions::default(),
            None,
            Some(second.completion()),
        )
        .await
        .unwrap();

    first.wait_terminal().await;
    second.wait_terminal().await;
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test]
async fn test_cache_key_filter_coalesces_urls_differing_only_in_query() {
    let transport = MockTransport::gated(vec![b"filtered"]);
    let (manager, _cache) = manager_with(transport.clone());
    manager.set_cache_key_filter(Some(Arc::new(|url: &Url| {
        let mut stripped = url.clone();
        stripped.set_query(None);
        stripped.to_string()
    })));

    let first = Recorder::new();
    let second = Recorder::new();
    manager
        .load(
            &test_url("photo.png?token=1"),
            RequestOptions::default(),
            None,
            Some(first.completion()),
        )
        .await
        .unwrap();
    manager
        .load(
            &test_url("photo.png?token=2"),
            RequestOptions::default(),
            None,
            Some(second.completion()),
        )
        .await
        .unwrap();
    transport.release();

    first.wait_terminal().await;
    second.wait_terminal().await;
    assert_eq!(
        transport.fetches(),
        1,
        "the filter strips the volatile query, so both URLs share one key"
    );
}

// --- cache policy ---

#[tokio::test]
async fn test_cache_hit_is_served_without_a_download() {
    let transport = MockTransport::ok(vec![b"network"]);
    let (manager, cache) = manager_with(transport.clone());
    let url = test_url("cached.png");
    cache.store(url.as_str(), Bytes::from_static(b"cached"), false).await;

    let recorder = Recorder::new();
    let handle = manager
        .load(&url, RequestOptions::default(), None, Some(recorder.completion()))
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"cached".as_slice()));
    assert_eq!(terminal.source, Some(CacheSource::Memory));
    assert_eq!(recorder.responses().len(), 1, "a cache hit completes in one call");
    assert_eq!(transport.fetches(), 0, "no download may start for a cache hit");
    assert!(!manager.is_running());

    // The no-op handle from a cache hit cancels nothing.
    handle.cancel();
    assert_eq!(recorder.responses().len(), 1);
}

#[tokio::test]
async fn test_refresh_cached_serves_stale_copy_then_revalidates() {
    let transport = MockTransport::ok(vec![b"fresh"]);
    let (manager, cache) = manager_with(transport.clone());
    let url = test_url("refresh.png");
    cache.store(url.as_str(), Bytes::from_static(b"stale"), false).await;

    let recorder = Recorder::new();
    let options = RequestOptions {
        refresh_cached: true,
        ..Default::default()
    };
    manager
        .load(&url, options, None, Some(recorder.completion()))
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    let responses = recorder.responses();
    assert!(responses.len() >= 2, "stale copy first, network result last");
    assert_eq!(responses[0].data.as_deref(), Some(b"stale".as_slice()));
    assert!(!responses[0].finished, "the cached copy is not the terminal result");
    assert_eq!(responses[0].source, Some(CacheSource::Memory));
    assert_eq!(terminal.data.as_deref(), Some(b"fresh".as_slice()));
    assert_eq!(terminal.source, Some(CacheSource::Network));
    assert_eq!(transport.fetches(), 1, "refresh must still hit the network");

    // The revalidated payload replaces the stale cache entry.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let hit = cache.lookup(url.as_str()).await;
        if hit.is_some_and(|hit| hit.data.as_ref() == b"fresh") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the cache was never refreshed with the network result"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_successful_download_populates_the_cache() {
    let transport = MockTransport::ok(vec![b"persisted"]);
    let (manager, cache) = manager_with(transport);
    let url = test_url("persist.png");

    let recorder = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(recorder.completion()))
        .await
        .unwrap();
    recorder.wait_terminal().await;

    wait_until(|| cache.contains(url.as_str()).then_some(())).await;
    let hit = cache.lookup(url.as_str()).await.unwrap();
    assert_eq!(hit.data.as_ref(), b"persisted");
}

#[tokio::test]
async fn test_memory_only_flag_reaches_the_cache_store() {
    let transport = MockTransport::ok(vec![b"volatile"]);
    let cache = RecordingCache::new();
    let downloader = Arc::new(ImageDownloader::with_transport(
        DownloaderConfig::default(),
        transport,
    ));
    let manager = ImageManager::new(downloader, cache.clone());
    let url = test_url("volatile.png");

    let recorder = Recorder::new();
    let options = RequestOptions {
        cache_memory_only: true,
        ..Default::default()
    };
    manager
        .load(&url, options, None, Some(recorder.completion()))
        .await
        .unwrap();
    recorder.wait_terminal().await;

    wait_until(|| (!cache.stored().is_empty()).then_some(())).await;
    assert_eq!(
        cache.stored(),
        vec![(url.to_string(), true)],
        "the store must be told to skip the disk tier"
    );
}

#[tokio::test]
async fn test_not_modified_result_is_not_written_back() {
    let transport = MockTransport::not_modified();
    let (manager, cache) = manager_with(transport);
    let url = test_url("unchanged.png");

    let recorder = Recorder::new();
    let options = RequestOptions {
        use_protocol_cache: true,
        ignore_cached_response: true,
        ..Default::default()
    };
    manager
        .load(&url, options, None, Some(recorder.completion()))
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    assert!(terminal.data.is_none(), "a revalidation hit carries no payload");
    assert!(terminal.error.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !cache.contains(url.as_str()),
        "an empty revalidation result must not overwrite the cache"
    );
}

// --- blacklist ---

#[tokio::test]
async fn test_failed_url_is_rejected_locally_until_retry_failed() {
    let transport = MockTransport::failing("connection refused");
    let (manager, _cache) = manager_with(transport.clone());
    let url = test_url("flaky.png");

    let first = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(first.completion()))
        .await
        .unwrap();
    let terminal = first.wait_terminal().await;
    assert!(terminal.error.is_some_and(|error| error.is_transport()));
    assert_eq!(transport.fetches(), 1);

    // A plain retry is rejected without touching the network.
    let second = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(second.completion()))
        .await
        .unwrap();
    let terminal = second.wait_terminal().await;
    let error = terminal.error.expect("blacklisted requests fail synthetically");
    assert!(
        matches!(*error, Error::Blacklisted(_)),
        "expected a blacklist rejection, got: {error}"
    );
    assert_eq!(transport.fetches(), 1, "the blacklist must prevent the fetch");

    // retry_failed bypasses the blacklist and reaches the network again.
    transport.set_behavior(MockBehavior::Chunks(vec![b"recovered"]));
    let third = Recorder::new();
    let options = RequestOptions {
        retry_failed: true,
        ..Default::default()
    };
    manager
        .load(&url, options, None, Some(third.completion()))
        .await
        .unwrap();
    let terminal = third.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"recovered".as_slice()));
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test]
async fn test_success_clears_the_blacklist_entry() {
    let transport = MockTransport::failing("boom");
    let (manager, cache) = manager_with(transport.clone());
    let url = test_url("healed.png");

    let first = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(first.completion()))
        .await
        .unwrap();
    first.wait_terminal().await;

    transport.set_behavior(MockBehavior::Chunks(vec![b"healed"]));
    let second = Recorder::new();
    let options = RequestOptions {
        retry_failed: true,
        ..Default::default()
    };
    manager
        .load(&url, options, None, Some(second.completion()))
        .await
        .unwrap();
    second.wait_terminal().await;

    // After the success the key is neither blacklisted nor refetched: the
    // plain request now serves from cache.
    wait_until(|| cache.contains(url.as_str()).then_some(())).await;
    let third = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(third.completion()))
        .await
        .unwrap();
    let terminal = third.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"healed".as_slice()));
    assert_eq!(terminal.source, Some(CacheSource::Memory));
}

#[tokio::test]
async fn test_cancellation_never_populates_the_blacklist() {
    let transport = MockTransport::gated(vec![b"abandoned"]);
    let (manager, _cache) = manager_with(transport.clone());
    let url = test_url("abandoned.png");

    let recorder = Recorder::new();
    let handle = manager
        .load(&url, RequestOptions::default(), None, Some(recorder.completion()))
        .await
        .unwrap();
    wait_until(|| (transport.fetches() == 1).then_some(())).await;
    handle.cancel();
    wait_until(|| (!manager.is_running()).then_some(())).await;

    // The same URL downloads normally afterwards.
    transport.release();
    let retry = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(retry.completion()))
        .await
        .unwrap();
    let terminal = retry.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"abandoned".as_slice()));
    assert_eq!(transport.fetches(), 2);
    assert!(
        recorder.responses().is_empty(),
        "the cancelled subscriber must hear nothing"
    );
}

// --- per-subscriber cancellation ---

#[tokio::test]
async fn test_cancelling_one_subscriber_keeps_the_shared_download_alive() {
    let transport = MockTransport::gated(vec![b"kept"]);
    let (manager, _cache) = manager_with(transport.clone());
    let url = test_url("partial.png");

    let first = Recorder::new();
    let second = Recorder::new();
    let first_handle = manager
        .load(&url, RequestOptions::default(), None, Some(first.completion()))
        .await
        .unwrap();
    manager
        .load(&url, RequestOptions::default(), None, Some(second.completion()))
        .await
        .unwrap();
    wait_until(|| (transport.fetches() == 1).then_some(())).await;

    first_handle.cancel();
    transport.release();

    let terminal = second.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"kept".as_slice()));
    assert!(
        first.responses().is_empty(),
        "subscriber 1 cancelled and must receive no further callbacks"
    );
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_last_cancel_removes_the_task_from_the_active_table() {
    let transport = MockTransport::gated(vec![b"dropped"]);
    let (manager, _cache) = manager_with(transport.clone());
    let url = test_url("dropped.png");

    let handle = manager
        .load(&url, RequestOptions::default(), None, None)
        .await
        .unwrap();
    wait_until(|| (transport.fetches() == 1).then_some(())).await;
    assert!(manager.is_running());

    handle.cancel();
    wait_until(|| (!manager.is_running()).then_some(())).await;
}

#[tokio::test]
async fn test_background_continuation_survives_the_last_cancel_and_fills_the_cache() {
    let transport = MockTransport::gated(vec![b"kept"]);
    let (manager, cache) = manager_with(transport.clone());
    let url = test_url("background.png");

    let recorder = Recorder::new();
    let options = RequestOptions {
        background_continuation: true,
        ..Default::default()
    };
    let handle = manager
        .load(&url, options, None, Some(recorder.completion()))
        .await
        .unwrap();
    wait_until(|| (transport.fetches() == 1).then_some(())).await;

    handle.cancel();
    transport.release();

    // The abandoned fetch runs to completion and still lands in the cache.
    wait_until(|| cache.contains(url.as_str()).then_some(())).await;
    let hit = cache.lookup(url.as_str()).await.unwrap();
    assert_eq!(hit.data.as_ref(), b"kept");
    assert!(
        recorder.responses().is_empty(),
        "the cancelled subscriber must hear nothing"
    );
}

#[tokio::test]
async fn test_cancel_all_clears_active_work_and_notifies_subscribers() {
    let transport = MockTransport::gated(vec![b"x"]);
    let (manager, _cache) = manager_with(transport.clone());

    let first = Recorder::new();
    let second = Recorder::new();
    manager
        .load(
            &test_url("a.png"),
            RequestOptions::default(),
            None,
            Some(first.completion()),
        )
        .await
        .unwrap();
    manager
        .load(
            &test_url("b.png"),
            RequestOptions::default(),
            None,
            Some(second.completion()),
        )
        .await
        .unwrap();
    assert!(manager.is_running());

    manager.cancel_all();
    assert!(!manager.is_running(), "cancel_all must clear the active table");

    for recorder in [&first, &second] {
        let terminal = recorder.wait_terminal().await;
        let error = terminal.error.expect("cancellation must surface");
        assert!(error.is_cancellation(), "expected a cancellation, got: {error}");
    }
}

// --- hooks ---

#[tokio::test]
async fn test_transform_hook_applies_before_delivery_and_caching() {
    let transport = MockTransport::ok(vec![b"raw"]);
    let (manager, cache) = manager_with(transport);
    manager.set_transform(Some(Arc::new(|data: Bytes, _url: &Url| {
        let mut decorated = data.to_vec();
        decorated.extend_from_slice(b"+transformed");
        Bytes::from(decorated)
    })));
    let url = test_url("transform.png");

    let recorder = Recorder::new();
    manager
        .load(&url, RequestOptions::default(), None, Some(recorder.completion()))
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    assert_eq!(terminal.data.as_deref(), Some(b"raw+transformed".as_slice()));

    wait_until(|| cache.contains(url.as_str()).then_some(())).await;
    let hit = cache.lookup(url.as_str()).await.unwrap();
    assert_eq!(
        hit.data.as_ref(),
        b"raw+transformed",
        "the cache must hold the transformed payload"
    );
}

#[tokio::test]
async fn test_avoid_auto_apply_skips_the_transform() {
    let transport = MockTransport::ok(vec![b"raw"]);
    let (manager, _cache) = manager_with(transport);
    manager.set_transform(Some(Arc::new(|_data: Bytes, _url: &Url| {
        Bytes::from_static(b"should-not-appear")
    })));

    let recorder = Recorder::new();
    let options = RequestOptions {
        avoid_auto_apply: true,
        ..Default::default()
    };
    manager
        .load(&test_url("manual.png"), options, None, Some(recorder.completion()))
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    assert_eq!(
        terminal.data.as_deref(),
        Some(b"raw".as_slice()),
        "with avoid_auto_apply the caller gets the untouched payload"
    );
}

#[tokio::test]
async fn test_should_download_veto_completes_without_data_or_error() {
    let transport = MockTransport::ok(vec![b"x"]);
    let (manager, _cache) = manager_with(transport.clone());
    manager.set_should_download(Some(Arc::new(|url: &Url| {
        !url.path().ends_with(".svg")
    })));

    let recorder = Recorder::new();
    manager
        .load(
            &test_url("vetoed.svg"),
            RequestOptions::default(),
            None,
            Some(recorder.completion()),
        )
        .await
        .unwrap();

    let terminal = recorder.wait_terminal().await;
    assert!(terminal.data.is_none());
    assert!(terminal.error.is_none(), "a veto is not a failure");
    assert_eq!(transport.fetches(), 0);

    // Non-vetoed URLs still download.
    let allowed = Recorder::new();
    manager
        .load(
            &test_url("allowed.png"),
            RequestOptions::default(),
            None,
            Some(allowed.completion()),
        )
        .await
        .unwrap();
    allowed.wait_terminal().await;
    assert_eq!(transport.fetches(), 1);
}

// --- existence checks ---

#[tokio::test]
async fn test_existence_checks_read_through_to_the_cache() {
    let transport = MockTransport::ok(vec![b"x"]);
    let (manager, cache) = manager_with(transport);
    let url = test_url("exists.png");

    assert!(!manager.cached_image_exists(&url));
    cache.store(url.as_str(), Bytes::from_static(b"data"), false).await;
    assert!(manager.cached_image_exists(&url));
    assert!(
        !manager.disk_image_exists(&url),
        "the memory store has no disk tier"
    );
}

#[tokio::test]
async fn test_async_existence_check_delivers_on_the_delivery_context() {
    let transport = MockTransport::ok(vec![b"x"]);
    let (manager, cache) = manager_with(transport);
    let url = test_url("async-exists.png");
    cache.store(url.as_str(), Bytes::from_static(b"data"), false).await;

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    manager.cached_image_exists_async(&url, move |exists| {
        *sink.lock().unwrap() = Some(exists);
    });

    let exists = wait_until(|| *seen.lock().unwrap()).await;
    assert!(exists);
}

#[tokio::test]
async fn test_save_image_to_cache_uses_the_derived_key() {
    let transport = MockTransport::ok(vec![b"x"]);
    let (manager, cache) = manager_with(transport);
    manager.set_cache_key_filter(Some(Arc::new(|url: &Url| {
        let mut stripped = url.clone();
        stripped.set_query(None);
        stripped.to_string()
    })));

    let url = test_url("saved.png?sig=abc");
    manager.save_image_to_cache(Bytes::from_static(b"saved"), &url).await;

    let stripped = test_url("saved.png");
    assert!(cache.contains(stripped.as_str()));
    assert!(manager.cached_image_exists(&url));
}
