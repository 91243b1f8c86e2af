//! Notification delivery
//!
//! Emitters push onto an unbounded channel and never wait. A single
//! background task drains the channel into a [`NotificationSink`] in emission
//! order. A sink failure is logged and the notification dropped.

use crate::notifications::{Notification, NotificationEvent, NotificationRecord};
use async_trait::async_trait;
use dialectic_core::fail_open::fail_open;
use dialectic_core::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where notifications end up (push channel, notifications table, stdout)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that keeps everything it receives
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<Notification>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.lock().iter().map(|n| n.event.clone()).collect()
    }

    /// Notification types in delivery order
    pub fn types(&self) -> Vec<&'static str> {
        self.lock().iter().map(|n| n.event.notification_type()).collect()
    }

    pub fn records(&self) -> Result<Vec<NotificationRecord>> {
        self.lock().iter().map(Notification::to_record).collect()
    }

    pub fn count_of(&self, notification_type: &str) -> usize {
        self.lock()
            .iter()
            .filter(|n| n.event.notification_type() == notification_type)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.lock().push(notification.clone());
        Ok(())
    }
}

/// Cloneable handle for emitting notifications
#[derive(Debug, Clone)]
pub struct NotificationEmitter {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationEmitter {
    pub fn emit(&self, target_user_id: &str, event: NotificationEvent) {
        let notification_type = event.notification_type();
        if self
            .tx
            .send(Notification::new(target_user_id, event))
            .is_err()
        {
            warn!(notification_type, "notification dispatcher is gone, dropping notification");
        }
    }
}

/// Owns the background delivery task
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
    handle: JoinHandle<usize>,
}

impl NotificationDispatcher {
    pub fn spawn<S>(sink: S) -> Self
    where
        S: NotificationSink + 'static,
    {
        Self::spawn_shared(Arc::new(sink))
    }

    pub fn spawn_shared(sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

        let handle = tokio::spawn(async move {
            let mut delivered = 0;
            while let Some(notification) = rx.recv().await {
                let notification_type = notification.event.notification_type();
                if fail_open("deliver_notification", sink.deliver(&notification))
                    .await
                    .is_some()
                {
                    delivered += 1;
                    debug!(notification_type, "notification delivered");
                }
            }
            delivered
        });

        Self { tx, handle }
    }

    pub fn emitter(&self) -> NotificationEmitter {
        NotificationEmitter {
            tx: self.tx.clone(),
        }
    }

    /// Wait until every emitted notification has been handed to the sink.
    ///
    /// Returns once all emitters are dropped; the number returned counts
    /// successful deliveries only.
    pub async fn finish(self) -> usize {
        drop(self.tx);
        match self.handle.await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(error = %e, "notification delivery task failed");
                0
            }
        }
    }
}
