//! Isolated fan-out of notifications to listeners.
//!
//! Every listener owns a bounded queue drained by its own task. Dispatch only does a
//! `try_send`, so a slow listener drops its own events instead of stalling the I/O
//! loop, and a listener that errors or panics does not affect the others.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::Result;
use crate::domain::NotificationEvent;
use crate::panic_hook;

/// Receives forwarded notifications.
#[async_trait]
pub trait NotificationListener: Send + Sync + 'static {
    async fn on_notification(&self, event: NotificationEvent) -> Result<()>;
}

struct ListenerSlot {
    name: String,
    tx: mpsc::Sender<NotificationEvent>,
}

pub struct ListenerSet {
    capacity: usize,
    slots: Mutex<Vec<ListenerSlot>>,
}

impl ListenerSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener and spawn its delivery task. Must be called inside a runtime.
    pub fn add(&self, name: impl Into<String>, listener: Arc<dyn NotificationListener>) {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<NotificationEvent>(self.capacity);

        let task_name = name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match panic_hook::contain(listener.on_notification(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(listener = %task_name, error = %e, "Listener failed"),
                    Err(_) => error!(listener = %task_name, "Listener panicked"),
                }
            }
            debug!(listener = %task_name, "Listener task finished");
        });

        self.slots.lock().push(ListenerSlot { name, tx });
    }

    /// Queue `event` for every listener. Returns how many accepted it.
    pub fn dispatch(&self, event: &NotificationEvent) -> usize {
        let mut slots = self.slots.lock();
        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(listener = %slot.name, "Listener queue full, dropping notification");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(listener = %slot.name, "Removing closed listener");
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
