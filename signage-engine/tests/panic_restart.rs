//! Panics reaching the supervisor through the installed hook.
//!
//! The panic hook is process-global, so this file holds a single test.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use signage_engine::config::EngineConfig;
use signage_engine::engine::SignageEngine;
use signage_engine::panic_hook;
use signage_engine::playback::{RenderReporter, RenderRequest, Renderer};
use signage_engine::supervisor::SupervisorEvent;
use signage_engine::Result;

struct NullRenderer;

#[async_trait]
impl Renderer for NullRenderer {
    async fn play(&self, _request: &RenderRequest, _reporter: RenderReporter) -> Result<()> {
        Ok(())
    }

    async fn release(&self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_panics_request_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default().rebase(dir.path());
    config.api_base_url = "http://127.0.0.1:9".to_string();
    config.connect_timeout = Duration::from_millis(500);
    config.request_timeout = Duration::from_secs(1);
    config.supervisor.restart_delay = Duration::from_millis(200);

    let engine = SignageEngine::open(config, Arc::new(NullRenderer))
        .await
        .expect("Failed to open engine");
    panic_hook::install(engine.crash_journal().clone());
    panic_hook::forward_to(engine.supervisor_handle());
    let mut events = engine.subscribe_supervisor();
    engine.start().await.unwrap();

    // Contained panics are logged only.
    let contained: std::thread::Result<()> =
        panic_hook::contain(async { panic!("listener bug") }).await;
    assert!(contained.is_err());
    assert!(engine.crash_journal().load().is_empty());

    for i in 0..3 {
        let task = tokio::spawn(async move {
            panic!("worker {i} crashed");
        });
        assert!(task.await.unwrap_err().is_panic());
        // Crashes are keyed by timestamp.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.crash_journal().load().len(), 3);

    let reason = tokio::time::timeout(Duration::from_secs(10), engine.restart_requested())
        .await
        .expect("restart was never requested");
    assert!(!reason.is_empty());

    let mut scheduled = false;
    while let Ok(event) = events.try_recv() {
        scheduled |= matches!(event, SupervisorEvent::RestartScheduled { .. });
    }
    assert!(scheduled, "no RestartScheduled event");

    engine.shutdown().await.unwrap();
}
