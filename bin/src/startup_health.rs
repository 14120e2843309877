use std::time::Duration;

use anyhow::{Result, anyhow};
use gateway_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// A task that is still running after the stabilization window counts as
/// started.
pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn running_task_passes() {
        let mut task = tokio::spawn(std::future::pending::<()>());
        assert!(verify_background_task_running("pending", &mut task).await.is_ok());
        task.abort();
    }

    #[tokio::test]
    async fn exited_task_fails() {
        let mut task = tokio::spawn(async {});
        let err = verify_background_task_running("quick", &mut task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quick exited"));
    }
}
