//! Request coalescing and cache coordination
//!
//! [`ImageManager`] is the public entry point for loading images: it
//! resolves each request to "serve from cache", "attach to the in-flight
//! download", or "create a new download", applies the failure blacklist
//! and the refresh policy, and writes completed results back into the
//! cache store.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use url::Url;

use crate::cache::{CacheStore, MemoryCacheStore};
use crate::config::DownloaderConfig;
use crate::downloader::{
    AttachOutcome, DownloadTask, ImageDownloader, RequestHandle, TaskOutcome, TerminalHook,
};
use crate::error::{Error, Result};
use crate::types::{
    CacheKeyFilterFn, CacheSource, CompletionFn, LoadResponse, ProgressFn, RequestOptions,
    ShouldDownloadFn, TransformFn,
};

#[derive(Default)]
struct ManagerHooks {
    cache_key_filter: Option<CacheKeyFilterFn>,
    transform: Option<TransformFn>,
    should_download: Option<ShouldDownloadFn>,
}

struct ManagerInner {
    downloader: Arc<ImageDownloader>,
    cache: Arc<dyn CacheStore>,
    active: Mutex<HashMap<String, Arc<DownloadTask>>>,
    blacklist: Mutex<HashSet<String>>,
    hooks: Mutex<ManagerHooks>,
}

impl ManagerInner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Arc<DownloadTask>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_blacklist(&self) -> MutexGuard<'_, HashSet<String>> {
        self.blacklist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hooks(&self) -> MutexGuard<'_, ManagerHooks> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminal bookkeeping for one task: drop the table entry, then
    /// update the blacklist and cache according to the outcome.
    fn finish_task(
        &self,
        task: &DownloadTask,
        key: &str,
        options: RequestOptions,
        outcome: &TaskOutcome,
    ) {
        {
            // A replacement task may already be registered under this key
            // (the finishing task was raced out of the table); only the
            // finishing task's own entry may be dropped.
            let mut active = self.lock_active();
            if active
                .get(key)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), task))
            {
                active.remove(key);
            }
        }
        match outcome {
            TaskOutcome::Completed { data } => {
                self.lock_blacklist().remove(key);
                if let Some(data) = data {
                    let cache = self.cache.clone();
                    let key = key.to_string();
                    let data = data.clone();
                    tokio::spawn(async move {
                        cache.store(&key, data, options.cache_memory_only).await;
                    });
                }
            }
            TaskOutcome::Failed(error) => {
                if !error.is_cancellation() && !options.retry_failed {
                    tracing::debug!(cache_key = %key, error = %error, "blacklisting after failure");
                    self.lock_blacklist().insert(key.to_string());
                }
            }
            TaskOutcome::Cancelled => {}
        }
    }
}

/// Coalescing image loading coordinator
///
/// Clones share the same active-download table, blacklist, cache store,
/// and downloader.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl ImageManager {
    /// Create a manager over the given downloader and cache store.
    pub fn new(downloader: Arc<ImageDownloader>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                downloader,
                cache,
                active: Mutex::new(HashMap::new()),
                blacklist: Mutex::new(HashSet::new()),
                hooks: Mutex::new(ManagerHooks::default()),
            }),
        }
    }

    /// Process-wide manager backed by a default downloader and an
    /// in-memory cache store.
    ///
    /// The first call must happen within a Tokio runtime. Independently
    /// constructed instances with their own downloader and cache pair are
    /// fully supported alongside this one.
    pub fn shared() -> &'static ImageManager {
        static SHARED: OnceLock<ImageManager> = OnceLock::new();
        SHARED.get_or_init(|| {
            ImageManager::new(
                Arc::new(ImageDownloader::new(DownloaderConfig::default())),
                Arc::new(MemoryCacheStore::new()),
            )
        })
    }

    /// The downloader this manager schedules downloads on.
    pub fn downloader(&self) -> &Arc<ImageDownloader> {
        &self.inner.downloader
    }

    /// Load the image at `url`, serving from cache when possible and
    /// coalescing concurrent requests for the same cache key into one
    /// download.
    ///
    /// The completion callback receives zero or more `finished = false`
    /// calls (partial content with `progressive`, the stale copy with
    /// `refresh_cached`) followed by exactly one `finished = true` call.
    /// The returned handle withdraws only this subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] when the options carry a
    /// forbidden combination.
    pub async fn load(
        &self,
        url: &Url,
        options: RequestOptions,
        progress: Option<ProgressFn>,
        completion: Option<CompletionFn>,
    ) -> Result<RequestHandle> {
        options.validate()?;

        if !self.allows_download(url) {
            tracing::debug!(url = %url, "download vetoed by hook");
            self.deliver(
                completion,
                LoadResponse {
                    url: url.clone(),
                    data: None,
                    error: None,
                    source: None,
                    finished: true,
                },
            );
            return Ok(RequestHandle::noop());
        }

        let key = self.cache_key_for(url);

        if let Some(hit) = self.inner.cache.lookup(&key).await {
            if !options.refresh_cached {
                tracing::debug!(url = %url, cache_key = %key, source = ?hit.source, "served from cache");
                self.deliver(
                    completion,
                    LoadResponse {
                        url: url.clone(),
                        data: Some(hit.data),
                        error: None,
                        source: Some(hit.source),
                        finished: true,
                    },
                );
                return Ok(RequestHandle::noop());
            }
            tracing::debug!(url = %url, cache_key = %key, "serving cached copy before revalidating");
            self.deliver(
                completion.clone(),
                LoadResponse {
                    url: url.clone(),
                    data: Some(hit.data),
                    error: None,
                    source: Some(hit.source),
                    finished: false,
                },
            );
        }

        if !options.retry_failed && self.inner.lock_blacklist().contains(&key) {
            tracing::debug!(url = %url, cache_key = %key, "rejected by failure blacklist");
            self.deliver(
                completion,
                LoadResponse {
                    url: url.clone(),
                    data: None,
                    error: Some(Arc::new(Error::Blacklisted(key))),
                    source: None,
                    finished: true,
                },
            );
            return Ok(RequestHandle::noop());
        }

        // Attach-or-create must be atomic so two requests for the same key
        // never produce two downloads.
        let task = {
            let mut active = self.inner.lock_active();
            if let Some(task) = active.get(&key) {
                match task.attach(progress.clone(), completion.clone(), options) {
                    AttachOutcome::Subscribed(handle) => {
                        tracing::debug!(url = %url, cache_key = %key, "attached to in-flight download");
                        return Ok(handle);
                    }
                    AttachOutcome::Finished(outcome) => {
                        // The task finished between table lookup and attach.
                        active.remove(&key);
                        if let TaskOutcome::Completed { data: Some(data) } = outcome {
                            self.deliver(
                                completion,
                                LoadResponse {
                                    url: url.clone(),
                                    data: Some(data),
                                    error: None,
                                    source: Some(CacheSource::Network),
                                    finished: true,
                                },
                            );
                            return Ok(RequestHandle::noop());
                        }
                    }
                }
            }

            let transform = if options.avoid_auto_apply {
                None
            } else {
                self.inner.lock_hooks().transform.clone()
            };
            let task = self.inner.downloader.create_task(
                url.clone(),
                key.clone(),
                options,
                transform,
                Some(self.terminal_hook(key.clone(), options)),
            );
            active.insert(key.clone(), task.clone());
            task
        };

        let handle = match task.attach(progress, completion, options) {
            AttachOutcome::Subscribed(handle) => handle,
            // A freshly created task is never terminal.
            AttachOutcome::Finished(_) => RequestHandle::noop(),
        };
        tracing::debug!(url = %url, cache_key = %key, "download task created");
        self.inner.downloader.submit(&task);
        Ok(handle)
    }

    /// Cancel every pending and running load and clear the active table.
    pub fn cancel_all(&self) {
        self.inner.downloader.cancel_all();
        self.inner.lock_active().clear();
    }

    /// Whether any load is pending or in flight.
    pub fn is_running(&self) -> bool {
        !self.inner.lock_active().is_empty()
    }

    /// The cache key used for `url`: the installed filter's result, or the
    /// URL itself when no filter is configured.
    pub fn cache_key_for(&self, url: &Url) -> String {
        match &self.inner.lock_hooks().cache_key_filter {
            Some(filter) => filter(url),
            None => url.to_string(),
        }
    }

    /// Whether any cache tier holds an entry for `url`.
    pub fn cached_image_exists(&self, url: &Url) -> bool {
        self.inner.cache.contains(&self.cache_key_for(url))
    }

    /// Whether the disk tier holds an entry for `url`.
    pub fn disk_image_exists(&self, url: &Url) -> bool {
        self.inner.cache.contains_on_disk(&self.cache_key_for(url))
    }

    /// Async variant of [`cached_image_exists`](Self::cached_image_exists);
    /// the callback runs on the delivery context.
    pub fn cached_image_exists_async(
        &self,
        url: &Url,
        callback: impl FnOnce(bool) + Send + 'static,
    ) {
        let exists = self.cached_image_exists(url);
        self.inner.downloader.delivery().dispatch(move || callback(exists));
    }

    /// Async variant of [`disk_image_exists`](Self::disk_image_exists);
    /// the callback runs on the delivery context.
    pub fn disk_image_exists_async(&self, url: &Url, callback: impl FnOnce(bool) + Send + 'static) {
        let exists = self.disk_image_exists(url);
        self.inner.downloader.delivery().dispatch(move || callback(exists));
    }

    /// Write `data` into the cache under the key derived for `url`.
    pub async fn save_image_to_cache(&self, data: Bytes, url: &Url) {
        let key = self.cache_key_for(url);
        self.inner.cache.store(&key, data, false).await;
    }

    /// Install or remove the hook deriving cache keys from request URLs
    /// (for example to strip volatile query parameters). Absent means the
    /// URL itself is the key.
    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilterFn>) {
        self.inner.lock_hooks().cache_key_filter = filter;
    }

    /// Install or remove the hook transforming downloaded payloads before
    /// caching and fan-out. Absent means payloads pass through unchanged.
    pub fn set_transform(&self, transform: Option<TransformFn>) {
        self.inner.lock_hooks().transform = transform;
    }

    /// Install or remove the per-URL download veto. Absent means every URL
    /// is allowed.
    pub fn set_should_download(&self, hook: Option<ShouldDownloadFn>) {
        self.inner.lock_hooks().should_download = hook;
    }

    fn allows_download(&self, url: &Url) -> bool {
        match &self.inner.lock_hooks().should_download {
            Some(hook) => hook(url),
            None => true,
        }
    }

    fn deliver(&self, completion: Option<CompletionFn>, response: LoadResponse) {
        if let Some(completion) = completion {
            self.inner
                .downloader
                .delivery()
                .dispatch(move || completion(response));
        }
    }

    fn terminal_hook(&self, key: String, options: RequestOptions) -> TerminalHook {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |task, outcome| {
            if let Some(inner) = inner.upgrade() {
                inner.finish_task(task, &key, options, outcome);
            }
        })
    }
}
