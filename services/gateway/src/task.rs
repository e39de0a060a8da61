//! Panic-isolating task spawning.
//!
//! Every long-lived per-connection task (read loop, write loop, resend
//! monitor) and every offloaded subscribe request goes through
//! [`spawn_guarded`]. A panic inside one subscriber's task must never take
//! the process — or any other subscriber — down with it.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `fut` on the runtime, catching and logging any panic.
pub fn spawn_guarded<F>(task: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let msg = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            error!(task, panic = %msg, "task panicked");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicking_task_is_contained() {
        let handle = spawn_guarded("test-panic", async {
            panic!("boom");
        });
        // The guard swallows the panic, so the join itself succeeds.
        handle.await.expect("join should not surface the panic");
    }

    #[tokio::test]
    async fn normal_task_runs_to_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_guarded("test-ok", async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.expect("task ran"), 42);
    }
}
