//! Shared download task
//!
//! One task performs exactly one network fetch and fans the result out to
//! every attached subscriber. Subscribers may attach while the fetch is in
//! flight (they receive future progress and the terminal result) and detach
//! individually without disturbing the others; when the last subscriber
//! leaves, the fetch itself is cancelled, unless the request asked for
//! background continuation or the transport cannot cancel cooperatively.

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::transport::{FetchRequest, Transport};
use crate::types::{
    CacheSource, CompletionFn, LoadResponse, Priority, ProgressFn, RequestOptions, TransformFn,
};

use super::delivery::DeliveryQueue;
use super::scheduler::SchedulerJob;

/// Lifecycle of a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Terminal result retained by a task for late attach attempts
#[derive(Clone)]
pub(crate) enum TaskOutcome {
    /// The fetch succeeded. `data` is `None` when the transport revalidated
    /// the resource as unchanged (HTTP 304), which carries no payload.
    Completed { data: Option<Bytes> },
    Failed(Arc<Error>),
    Cancelled,
}

/// Observer installed by the coordinator, invoked exactly once when the
/// task reaches a terminal state, before subscriber fan-out. Receives the
/// finishing task so the coordinator can tell it apart from a replacement
/// registered under the same cache key. Must not block; async follow-up
/// work (cache writes) is spawned by the observer.
pub(crate) type TerminalHook = Arc<dyn Fn(&DownloadTask, &TaskOutcome) + Send + Sync>;

/// Result of an attach attempt
pub(crate) enum AttachOutcome {
    /// The subscriber was registered; cancel through the handle.
    Subscribed(RequestHandle),
    /// The task already finished; the retained outcome is returned instead.
    Finished(TaskOutcome),
}

struct Subscriber {
    id: u64,
    progress: Option<ProgressFn>,
    completion: Option<CompletionFn>,
    options: RequestOptions,
    cancelled: Arc<AtomicBool>,
}

struct TaskInner {
    state: TaskState,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    received: u64,
    total_expected: Option<u64>,
    outcome: Option<TaskOutcome>,
}

/// Everything a task needs to run, assembled by the downloader
pub(crate) struct TaskParams {
    pub(crate) url: Url,
    pub(crate) cache_key: String,
    pub(crate) options: RequestOptions,
    pub(crate) request: FetchRequest,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) transform: Option<TransformFn>,
    pub(crate) on_terminal: Option<TerminalHook>,
}

/// One shared network fetch with an ordered set of subscribers
pub(crate) struct DownloadTask {
    url: Url,
    cache_key: String,
    options: RequestOptions,
    request: FetchRequest,
    transport: Arc<dyn Transport>,
    delivery: DeliveryQueue,
    transform: Option<TransformFn>,
    on_terminal: Option<TerminalHook>,
    cancel: CancellationToken,
    inner: Mutex<TaskInner>,
}

impl DownloadTask {
    pub(crate) fn new(params: TaskParams) -> Arc<Self> {
        Arc::new(Self {
            url: params.url,
            cache_key: params.cache_key,
            options: params.options,
            request: params.request,
            transport: params.transport,
            delivery: params.delivery,
            transform: params.transform,
            on_terminal: params.on_terminal,
            cancel: CancellationToken::new(),
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                subscribers: Vec::new(),
                next_subscriber: 0,
                received: 0,
                total_expected: None,
                outcome: None,
            }),
        })
    }

    pub(crate) fn priority(&self) -> Priority {
        self.options.priority()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TaskState {
        self.lock().state
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    #[cfg(test)]
    pub(crate) fn received_bytes(&self) -> u64 {
        self.lock().received
    }

    pub(crate) fn mark_queued(&self) {
        let mut inner = self.lock();
        if inner.state == TaskState::Created {
            inner.state = TaskState::Queued;
        }
    }

    /// Register a subscriber, or surface the retained outcome when the task
    /// already reached a terminal state.
    pub(crate) fn attach(
        self: &Arc<Self>,
        progress: Option<ProgressFn>,
        completion: Option<CompletionFn>,
        options: RequestOptions,
    ) -> AttachOutcome {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            let outcome = inner.outcome.clone().unwrap_or(TaskOutcome::Cancelled);
            return AttachOutcome::Finished(outcome);
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        inner.subscribers.push(Subscriber {
            id,
            progress,
            completion,
            options,
            cancelled: cancelled.clone(),
        });
        tracing::debug!(
            url = %self.url,
            subscriber = id,
            count = inner.subscribers.len(),
            "subscriber attached"
        );
        AttachOutcome::Subscribed(RequestHandle {
            task: Some(self.clone()),
            subscriber: id,
            cancelled,
        })
    }

    /// Remove one subscriber. Emptying the set cancels the fetch, unless
    /// the request asked for background continuation or the transport does
    /// not support cooperative cancellation.
    fn detach(&self, id: u64) {
        let now_empty = {
            let mut inner = self.lock();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|subscriber| subscriber.id != id);
            if inner.subscribers.len() == before || inner.state.is_terminal() {
                return;
            }
            inner.subscribers.is_empty()
        };
        if !now_empty {
            return;
        }
        if self.options.background_continuation || !self.transport.supports_cancellation() {
            tracing::debug!(url = %self.url, "last subscriber left, letting the fetch finish");
            return;
        }
        tracing::debug!(url = %self.url, "last subscriber left, cancelling the fetch");
        self.abort_fetch();
    }

    /// Signal cooperative cancellation. A task that never started running
    /// reaches its terminal state here; a running task observes the token
    /// and finishes from its own loop.
    fn abort_fetch(&self) {
        let started = matches!(self.lock().state, TaskState::Running);
        self.cancel.cancel();
        if !started {
            self.finish(TaskOutcome::Cancelled);
        }
    }

    async fn execute(&self) -> TaskOutcome {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
            result = self.transport.fetch(self.request.clone(), self.cancel.clone()) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(Error::Cancelled) => return TaskOutcome::Cancelled,
            Err(error) => return TaskOutcome::Failed(Arc::new(error)),
        };

        if response.not_modified {
            return TaskOutcome::Completed { data: None };
        }

        {
            let mut inner = self.lock();
            inner.total_expected = response.total_bytes;
        }
        self.deliver_progress(0, None);

        let mut body = response.body;
        let mut buffer = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
                chunk = body.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Err(error)) => return TaskOutcome::Failed(Arc::new(error)),
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    let received = buffer.len() as u64;
                    let partial = {
                        let mut inner = self.lock();
                        inner.received = received;
                        inner
                            .subscribers
                            .iter()
                            .any(|subscriber| subscriber.options.progressive)
                            .then(|| Bytes::copy_from_slice(&buffer))
                    };
                    self.deliver_progress(received, partial);
                }
            }
        }

        if buffer.is_empty() {
            return TaskOutcome::Failed(Arc::new(Error::Decode(
                "downloaded payload is empty".to_string(),
            )));
        }

        let mut data = Bytes::from(buffer);
        if let Some(transform) = &self.transform {
            data = transform(data, &self.url);
        }
        TaskOutcome::Completed { data: Some(data) }
    }

    /// Fan out a progress update: byte counts to subscribers with a
    /// progress callback, partial content to subscribers that asked for
    /// progressive delivery.
    fn deliver_progress(&self, received: u64, partial: Option<Bytes>) {
        let (total, snapshot) = {
            let inner = self.lock();
            let snapshot: Vec<_> = inner
                .subscribers
                .iter()
                .map(|subscriber| {
                    (
                        subscriber.progress.clone(),
                        subscriber.completion.clone(),
                        subscriber.options.progressive,
                        subscriber.cancelled.clone(),
                    )
                })
                .collect();
            (inner.total_expected, snapshot)
        };
        for (progress, completion, progressive, cancelled) in snapshot {
            if let Some(progress) = progress {
                let cancelled = cancelled.clone();
                self.delivery.dispatch(move || {
                    if !cancelled.load(Ordering::SeqCst) {
                        progress(received, total);
                    }
                });
            }
            if !progressive {
                continue;
            }
            let (Some(completion), Some(data)) = (completion, partial.clone()) else {
                continue;
            };
            let response = LoadResponse {
                url: self.url.clone(),
                data: Some(data),
                error: None,
                source: Some(CacheSource::Network),
                finished: false,
            };
            self.delivery.dispatch(move || {
                if !cancelled.load(Ordering::SeqCst) {
                    completion(response);
                }
            });
        }
    }

    /// Transition to a terminal state, notify the coordinator, and deliver
    /// exactly one terminal callback to every still-attached subscriber.
    fn finish(&self, outcome: TaskOutcome) {
        let subscribers = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = match &outcome {
                TaskOutcome::Completed { .. } => TaskState::Completed,
                TaskOutcome::Failed(_) => TaskState::Failed,
                TaskOutcome::Cancelled => TaskState::Cancelled,
            };
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.subscribers)
        };

        match &outcome {
            TaskOutcome::Completed { data } => tracing::debug!(
                url = %self.url,
                cache_key = %self.cache_key,
                bytes = data.as_ref().map_or(0, Bytes::len),
                "download completed"
            ),
            TaskOutcome::Failed(error) => {
                tracing::warn!(url = %self.url, error = %error, "download failed");
            }
            TaskOutcome::Cancelled => {
                tracing::debug!(url = %self.url, "download cancelled");
            }
        }

        if let Some(hook) = &self.on_terminal {
            hook(self, &outcome);
        }

        for subscriber in subscribers {
            let Some(completion) = subscriber.completion else {
                continue;
            };
            let response = terminal_response(&self.url, &outcome);
            let cancelled = subscriber.cancelled;
            self.delivery.dispatch(move || {
                if !cancelled.load(Ordering::SeqCst) {
                    completion(response);
                }
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn terminal_response(url: &Url, outcome: &TaskOutcome) -> LoadResponse {
    match outcome {
        TaskOutcome::Completed { data } => LoadResponse {
            url: url.clone(),
            data: data.clone(),
            error: None,
            source: data.is_some().then_some(CacheSource::Network),
            finished: true,
        },
        TaskOutcome::Failed(error) => LoadResponse {
            url: url.clone(),
            data: None,
            error: Some(error.clone()),
            source: None,
            finished: true,
        },
        TaskOutcome::Cancelled => LoadResponse {
            url: url.clone(),
            data: None,
            error: Some(Arc::new(Error::Cancelled)),
            source: None,
            finished: true,
        },
    }
}

impl SchedulerJob for DownloadTask {
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let mut inner = self.lock();
                // Cancelled while still queued; nothing to do.
                if inner.state.is_terminal() {
                    return;
                }
                inner.state = TaskState::Running;
            }
            tracing::debug!(url = %self.url, cache_key = %self.cache_key, "download started");
            let outcome = self.execute().await;
            self.finish(outcome);
        })
    }

    fn abort(&self) {
        self.abort_fetch();
    }
}

/// Cancel handle returned for every load and download request
///
/// Cancelling is idempotent, never blocks, and affects only this
/// subscription: other subscribers sharing the same download keep
/// receiving callbacks, and the network fetch itself is aborted only when
/// the last subscriber leaves. No callback is delivered to a subscriber
/// after its handle was cancelled.
pub struct RequestHandle {
    task: Option<Arc<DownloadTask>>,
    subscriber: u64,
    cancelled: Arc<AtomicBool>,
}

impl RequestHandle {
    /// A handle for a request satisfied without a download (cache hits,
    /// vetoed or blacklisted requests). Cancelling it has no effect.
    pub(crate) fn noop() -> Self {
        Self {
            task: None,
            subscriber: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Withdraw this subscription from its download.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = &self.task {
            task.detach(self.subscriber);
        }
    }

    /// Whether [`cancel`](Self::cancel) was invoked on this handle.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
