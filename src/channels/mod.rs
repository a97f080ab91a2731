//! Replay-capable output channels.
//!
//! Each channel keeps its latest value; a new subscriber gets that value
//! first and then everything published after it, with no gap and no
//! duplicate in between.

use crate::model::{EventUpdate, JobStatus, PrinterStatus, ZOffset};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

struct Inner<T> {
    latest: Mutex<Option<T>>,
    sender: broadcast::Sender<T>,
}

pub struct ReplayChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReplayChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> ReplayChannel<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                latest: Mutex::new(None),
                sender,
            }),
        }
    }

    pub fn with_initial(value: T) -> Self {
        let channel = Self::new();
        channel.publish(value);
        channel
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, value: T) {
        self.publish_if(value, || true);
    }

    /// Publishes only if `guard` holds, checked under the channel lock.
    pub fn publish_if(&self, value: T, guard: impl FnOnce() -> bool) -> bool {
        let mut latest = self.lock();
        if !guard() {
            return false;
        }
        *latest = Some(value.clone());
        // No receivers is fine; the value is kept for replay.
        let _ = self.inner.sender.send(value);
        true
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let latest = self.lock();
        Subscription {
            pending: latest.clone(),
            receiver: self.inner.sender.subscribe(),
        }
    }
}

impl<T: Clone> Default for ReplayChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription<T> {
    pending: Option<T>,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next value; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged; skipping to newer values");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// The four consumer-facing streams of one printer.
#[derive(Clone, Default)]
pub struct Channels {
    pub printer_status: ReplayChannel<PrinterStatus>,
    pub job_status: ReplayChannel<JobStatus>,
    pub events: ReplayChannel<EventUpdate>,
    pub z_offset: ReplayChannel<ZOffset>,
    epoch: Arc<AtomicU64>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new connection epoch. Every publisher handed out before
    /// stops publishing.
    pub fn publisher(&self) -> Publisher {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Publisher {
            channels: self.clone(),
            epoch,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Write side of [`Channels`] bound to one connection epoch.
#[derive(Clone)]
pub struct Publisher {
    channels: Channels,
    epoch: u64,
}

impl Publisher {
    pub fn is_current(&self) -> bool {
        self.channels.current_epoch() == self.epoch
    }

    fn publish_to<T: Clone>(&self, channel: &ReplayChannel<T>, value: T) -> bool {
        let published = channel.publish_if(value, || self.is_current());
        if !published {
            tracing::trace!(epoch = self.epoch, "dropping update from superseded connection");
        }
        published
    }

    pub fn printer_status(&self, status: &PrinterStatus) -> bool {
        self.publish_to(&self.channels.printer_status, status.clone())
    }

    pub fn job_status(&self, job: &JobStatus) -> bool {
        self.publish_to(&self.channels.job_status, job.clone())
    }

    pub fn event(&self, update: impl Into<EventUpdate>) -> bool {
        self.publish_to(&self.channels.events, update.into())
    }

    pub fn z_offset(&self, offset: ZOffset) -> bool {
        self.publish_to(&self.channels.z_offset, offset)
    }
}
