//! Scripted backend for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use super::{AlertReport, BackendApi, EventStreamConnector, HealthReport, StreamSignal};
use crate::domain::{CurrentContentSnapshot, PollResponse, SyncResponse};
use crate::{Error, Result};

/// Queued responses, then a steady one.
pub struct Script<T> {
    queue: Mutex<VecDeque<Result<T>>>,
    steady: Mutex<Option<T>>,
    calls: AtomicUsize,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            steady: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone> Script<T> {
    pub fn push(&self, response: Result<T>) {
        self.queue.lock().push_back(response);
    }

    pub fn set_steady(&self, response: T) {
        *self.steady.lock() = Some(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.queue.lock().pop_front() {
            return response;
        }
        self.steady
            .lock()
            .clone()
            .ok_or_else(|| Error::Timeout("no scripted response".into()))
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub sync: Script<SyncResponse>,
    pub content: Script<CurrentContentSnapshot>,
    pub poll: Script<PollResponse>,
    pub health: Mutex<Vec<HealthReport>>,
    pub alerts: Mutex<Vec<AlertReport>>,
    pub fail_alerts: AtomicBool,
    pub forgot_credentials: AtomicBool,
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn fetch_sync(&self) -> Result<SyncResponse> {
        self.sync.next()
    }

    async fn fetch_current_content(&self) -> Result<CurrentContentSnapshot> {
        self.content.next()
    }

    async fn poll_notifications(&self) -> Result<PollResponse> {
        self.poll.next()
    }

    async fn post_health(&self, report: &HealthReport) -> Result<()> {
        self.health.lock().push(report.clone());
        Ok(())
    }

    async fn post_alert(&self, alert: &AlertReport) -> Result<()> {
        if self.fail_alerts.load(Ordering::SeqCst) {
            return Err(Error::Timeout("alert endpoint down".into()));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    fn forget_credentials(&self) {
        self.forgot_credentials.store(true, Ordering::SeqCst);
    }
}

/// Connector whose every connection attempt fails, or yields scripted signals.
#[derive(Default)]
pub struct FakeConnector {
    pub sessions: Mutex<VecDeque<Vec<StreamSignal>>>,
    pub connects: AtomicUsize,
}

#[async_trait]
impl EventStreamConnector for FakeConnector {
    async fn connect(&self) -> Result<BoxStream<'static, Result<StreamSignal>>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().pop_front() {
            Some(signals) => Ok(futures::stream::iter(signals.into_iter().map(Ok)).boxed()),
            None => Err(Error::Timeout("connect refused".into())),
        }
    }
}
