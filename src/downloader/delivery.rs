//! Serialized callback delivery
//!
//! Every subscriber callback — progress, partial content, terminal result,
//! synthesized cache/blacklist completions, async existence checks — is
//! funneled through one consumer task. A caller therefore never observes
//! two overlapping callbacks, and callbacks for a single subscriber arrive
//! in dispatch order.

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Handle to the single delivery context of a downloader instance
#[derive(Clone)]
pub(crate) struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryQueue {
    /// Spawn the consumer task. Must be called within a Tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Enqueue a callback for delivery.
    ///
    /// Silently dropped when the consumer is gone (runtime shutdown) —
    /// there is nobody left to call back.
    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).ok();
    }
}
