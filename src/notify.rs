//! Unread-count notifications.
//!
//! Workers enqueue a target whenever a poll brought new mail. A single
//! consumer task computes the user's unread count and pushes it. Failures
//! are logged and dropped; the next poll with new mail enqueues again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::UnreadSink;
use crate::mailbox::NotificationTarget;

struct Inner {
    pending: Mutex<VecDeque<NotificationTarget>>,
    wake: Notify,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, VecDeque<NotificationTarget>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl NotificationDispatcher {
    /// Start the consumer task. It exits when `cancel` fires, dropping
    /// whatever is still pending.
    pub fn spawn(sink: Arc<dyn UnreadSink>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(Inner {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        });
        let handle = tokio::spawn(consume(Arc::clone(&inner), sink, cancel));
        (Self { inner }, handle)
    }

    /// Queue a push for `target`. A target already waiting is not queued
    /// twice. Returns whether it was added.
    pub fn enqueue(&self, target: NotificationTarget) -> bool {
        {
            let mut pending = self.inner.pending();
            if pending.contains(&target) {
                return false;
            }
            pending.push_back(target);
        }
        self.inner.wake.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        self.inner.pending().len()
    }
}

async fn consume(inner: Arc<Inner>, sink: Arc<dyn UnreadSink>, cancel: CancellationToken) {
    loop {
        let next = inner.pending().pop_front();
        let Some(target) = next else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.wake.notified() => {}
            }
            continue;
        };
        if cancel.is_cancelled() {
            break;
        }
        push(sink.as_ref(), &target).await;
    }

    let dropped = inner.pending().len();
    info!(dropped, "Notification dispatcher stopped");
}

async fn push(sink: &dyn UnreadSink, target: &NotificationTarget) {
    let count = match sink.unread_count(target).await {
        Ok(count) => count,
        Err(e) => {
            warn!(tenant = target.tenant, user_id = %target.user_id, "Failed to count unread mail: {e}");
            return;
        }
    };
    match sink.push_unread_count(target, count).await {
        Ok(()) => debug!(tenant = target.tenant, user_id = %target.user_id, count, "Pushed unread count"),
        Err(e) => warn!(tenant = target.tenant, user_id = %target.user_id, "Failed to push unread count: {e}"),
    }
}
