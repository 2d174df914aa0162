use chrono::Local;
use futures::FutureExt;
use std::{
    backtrace::Backtrace,
    cell::Cell,
    future::Future,
    panic::{AssertUnwindSafe, PanicHookInfo, take_hook},
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
    thread,
};

use crate::supervisor::{CrashJournal, CrashRecord, SupervisorHandle};

static SUPERVISOR: OnceLock<SupervisorHandle> = OnceLock::new();

thread_local! {
    /// Depth of [`contain`] scopes currently polling on this thread.
    static CONTAINED: Cell<usize> = const { Cell::new(0) };
}

/// Installs a global panic hook that logs the panic, writes a crash record to
/// `journal` synchronously and, once [`forward_to`] was called, reports it to the
/// supervisor.
pub fn install(journal: Arc<CrashJournal>) {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let payload = panic_payload_to_string(panic_info);
            let location = panic_info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

            if is_contained() {
                tracing::warn!(
                    target: "signage_engine::panic",
                    location = location.as_deref().unwrap_or("<unknown>"),
                    "Contained panic: {payload}"
                );
                return;
            }

            tracing::error!(
                target: "signage_engine::panic",
                "{}",
                format_panic_record(&payload, location.as_deref())
            );

            let record = CrashRecord::capture(format!("panic: {payload}"), location);
            if let Err(e) = journal.append(&record) {
                tracing::error!(error = %e, "Failed to journal panic");
            }
            if let Some(supervisor) = SUPERVISOR.get() {
                supervisor.report_crash(&record);
            }
        }));

        previous_hook(panic_info);
    }));
}

/// Route journaled panics to the supervisor. Only the first call takes effect.
pub fn forward_to(supervisor: SupervisorHandle) {
    let _ = SUPERVISOR.set(supervisor);
}

/// Run `future`, turning a panic into `Err`. Panics raised while it is polled are
/// logged but not journaled or counted as crashes.
pub async fn contain<F: Future>(future: F) -> thread::Result<F::Output> {
    AssertUnwindSafe(Contained {
        inner: Box::pin(future),
    })
    .catch_unwind()
    .await
}

/// Whether the current thread is polling inside [`contain`].
pub fn is_contained() -> bool {
    CONTAINED.with(|depth| depth.get() > 0)
}

struct Contained<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Contained<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _scope = ContainedScope::enter();
        self.inner.as_mut().poll(cx)
    }
}

struct ContainedScope;

impl ContainedScope {
    fn enter() -> Self {
        CONTAINED.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for ContainedScope {
    fn drop(&mut self) {
        CONTAINED.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn format_panic_record(payload: &str, location: Option<&str>) -> String {
    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    let backtrace = Backtrace::force_capture();
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");

    format!(
        "{ts} PANIC thread={thread_name} location={} payload={payload}\nBacktrace:\n{backtrace}",
        location.unwrap_or("<unknown>")
    )
}

fn panic_payload_to_string(panic_info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        return s.clone();
    }
    panic_info.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contain_catches_panic_and_resets_scope() {
        assert!(!is_contained());

        let seen = contain(async { is_contained() }).await.unwrap();
        assert!(seen);

        let result: thread::Result<()> = contain(async {
            tokio::task::yield_now().await;
            panic!("listener failed");
        })
        .await;
        assert!(result.is_err());
        assert!(!is_contained());
    }
}
