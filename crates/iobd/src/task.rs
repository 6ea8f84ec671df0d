//! Detached background work.
//!
//! Anything the broker fires and forgets goes through [`spawn_detached`]
//! so failures are logged in one place instead of silently dropped.

use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawns `fut` on the runtime and logs its error, if any, under `name`.
pub fn spawn_detached<F, E>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => debug!(task = name, "Detached task finished"),
            Err(e) => error!(task = name, error = %e, "Detached task failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        spawn_detached("flag", async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await
        .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_does_not_propagate() {
        let handle = spawn_detached("failing", async { Err::<(), _>("boom") });
        assert!(handle.await.is_ok());
    }
}
