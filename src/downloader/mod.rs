//! Core downloader implementation split into focused submodules.
//!
//! The [`ImageDownloader`] struct and its collaborators are organized by
//! domain:
//! - [`scheduler`] - Bounded-concurrency admission control with priority
//!   tiers and FIFO/LIFO ordering
//! - [`task`] - Shared download tasks with subscriber fan-out
//! - [`delivery`] - Serialized callback delivery

mod delivery;
mod scheduler;
mod task;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use task::RequestHandle;

pub(crate) use delivery::DeliveryQueue;
pub(crate) use task::{AttachOutcome, DownloadTask, TaskOutcome, TaskParams, TerminalHook};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use url::Url;

use crate::config::{DownloaderConfig, ExecutionOrder};
use crate::error::Result;
use crate::transport::{FetchRequest, HttpTransport, Transport};
use crate::types::{CompletionFn, HeadersFilterFn, ProgressFn, RequestOptions, TransformFn};

use scheduler::Scheduler;

/// Runtime-mutable download settings, one lock for the whole group
struct DownloadSettings {
    headers: HashMap<String, String>,
    user_agent: String,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    headers_filter: Option<HeadersFilterFn>,
}

/// Asynchronous image downloader
///
/// Owns the admission scheduler, the network transport, the delivery
/// context all callbacks run on, and the mutable download settings.
/// Every call to [`download`](Self::download) performs its own fetch;
/// coalescing identical requests is the job of
/// [`ImageManager`](crate::manager::ImageManager).
pub struct ImageDownloader {
    scheduler: Scheduler,
    transport: Arc<dyn Transport>,
    delivery: DeliveryQueue,
    settings: Mutex<DownloadSettings>,
}

impl ImageDownloader {
    /// Create a downloader backed by the default HTTP transport.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: DownloaderConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    /// Create a downloader with a custom [`Transport`] implementation.
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_transport(config: DownloaderConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            scheduler: Scheduler::new(config.max_concurrent_downloads, config.execution_order),
            transport,
            delivery: DeliveryQueue::spawn(),
            settings: Mutex::new(DownloadSettings {
                headers: config.default_headers,
                user_agent: config.user_agent,
                timeout: config.download_timeout,
                username: config.username,
                password: config.password,
                headers_filter: None,
            }),
        }
    }

    /// Process-wide downloader with default configuration.
    ///
    /// The first call must happen within a Tokio runtime. Independently
    /// constructed instances are fully supported alongside this one.
    pub fn shared() -> &'static ImageDownloader {
        static SHARED: OnceLock<ImageDownloader> = OnceLock::new();
        SHARED.get_or_init(|| ImageDownloader::new(DownloaderConfig::default()))
    }

    /// Schedule a download for `url` and attach the given callbacks.
    ///
    /// Returns a handle that withdraws this subscription; see
    /// [`RequestHandle::cancel`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`](crate::error::Error::InvalidOptions)
    /// when the options carry a forbidden combination.
    pub fn download(
        &self,
        url: &Url,
        options: RequestOptions,
        progress: Option<ProgressFn>,
        completion: Option<CompletionFn>,
    ) -> Result<RequestHandle> {
        options.validate()?;
        let task = self.create_task(url.clone(), url.to_string(), options, None, None);
        let handle = match task.attach(progress, completion, options) {
            AttachOutcome::Subscribed(handle) => handle,
            // A freshly created task is never terminal.
            AttachOutcome::Finished(_) => RequestHandle::noop(),
        };
        self.submit(&task);
        Ok(handle)
    }

    /// Build a task without submitting it. The coordinator attaches its
    /// subscriber and registers the task before submission.
    pub(crate) fn create_task(
        &self,
        url: Url,
        cache_key: String,
        options: RequestOptions,
        transform: Option<TransformFn>,
        on_terminal: Option<TerminalHook>,
    ) -> Arc<DownloadTask> {
        let request = self.build_request(&url, options);
        DownloadTask::new(TaskParams {
            url,
            cache_key,
            options,
            request,
            transport: self.transport.clone(),
            delivery: self.delivery.clone(),
            transform,
            on_terminal,
        })
    }

    pub(crate) fn submit(&self, task: &Arc<DownloadTask>) {
        task.mark_queued();
        self.scheduler.submit(task.clone(), task.priority());
    }

    pub(crate) fn delivery(&self) -> DeliveryQueue {
        self.delivery.clone()
    }

    fn build_request(&self, url: &Url, options: RequestOptions) -> FetchRequest {
        let settings = self.lock_settings();
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = %name, "skipping invalid header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::warn!(header = %name, "skipping invalid header value");
                continue;
            };
            headers.insert(name, value);
        }
        if let Ok(user_agent) = HeaderValue::from_str(&settings.user_agent) {
            headers.insert(USER_AGENT, user_agent);
        }
        if let Some(filter) = &settings.headers_filter {
            headers = filter(url, headers);
        }
        FetchRequest {
            url: url.clone(),
            headers,
            timeout: settings.timeout,
            credentials: settings
                .username
                .clone()
                .map(|username| (username, settings.password.clone())),
            use_protocol_cache: options.use_protocol_cache,
            allow_insecure_tls: options.allow_insecure_tls,
            handle_cookies: options.handle_cookies,
        }
    }

    /// Halt new admissions. Running downloads continue to completion.
    pub fn set_suspended(&self, suspended: bool) {
        self.scheduler.set_suspended(suspended);
    }

    /// Whether admission is currently halted.
    pub fn is_suspended(&self) -> bool {
        self.scheduler.is_suspended()
    }

    /// Change the concurrency ceiling. Lowering it never preempts running
    /// downloads; it only throttles future admissions.
    pub fn set_max_concurrent_downloads(&self, max_concurrent: usize) {
        self.scheduler.set_max_concurrent(max_concurrent);
    }

    /// Current concurrency ceiling.
    pub fn max_concurrent_downloads(&self) -> usize {
        self.scheduler.max_concurrent()
    }

    /// Change the admission order among same-priority pending downloads.
    pub fn set_execution_order(&self, execution_order: ExecutionOrder) {
        self.scheduler.set_execution_order(execution_order);
    }

    /// Current admission order.
    pub fn execution_order(&self) -> ExecutionOrder {
        self.scheduler.execution_order()
    }

    /// Downloads currently pending or running.
    pub fn current_download_count(&self) -> usize {
        self.scheduler.current_count()
    }

    /// Cancel every pending and running download.
    ///
    /// Pending downloads are dropped without starting; running downloads
    /// receive the cooperative cancellation signal and tear down
    /// asynchronously. Every still-attached subscriber receives a
    /// cancellation outcome.
    pub fn cancel_all(&self) {
        self.scheduler.cancel_all();
    }

    /// Set or remove a default HTTP header sent with every request.
    ///
    /// Header names are case-insensitive; passing `None` removes the
    /// header.
    pub fn set_http_header(&self, name: &str, value: Option<&str>) {
        let name = name.to_ascii_lowercase();
        let mut settings = self.lock_settings();
        match value {
            Some(value) => {
                settings.headers.insert(name, value.to_string());
            }
            None => {
                settings.headers.remove(&name);
            }
        }
    }

    /// Current value of a default HTTP header, if set.
    pub fn http_header(&self, name: &str) -> Option<String> {
        self.lock_settings()
            .headers
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Change the timeout applied to each download.
    pub fn set_download_timeout(&self, timeout: Duration) {
        self.lock_settings().timeout = timeout;
    }

    /// Timeout applied to each download.
    pub fn download_timeout(&self) -> Duration {
        self.lock_settings().timeout
    }

    /// Username for HTTP Basic authentication; `None` disables it.
    pub fn set_username(&self, username: Option<&str>) {
        self.lock_settings().username = username.map(str::to_string);
    }

    /// Password for HTTP Basic authentication.
    pub fn set_password(&self, password: Option<&str>) {
        self.lock_settings().password = password.map(str::to_string);
    }

    /// Install or remove a hook rewriting the headers of each request
    /// after the defaults are applied.
    pub fn set_headers_filter(&self, filter: Option<HeadersFilterFn>) {
        self.lock_settings().headers_filter = filter;
    }

    fn lock_settings(&self) -> MutexGuard<'_, DownloadSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
