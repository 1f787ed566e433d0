//! Bounded retry and readiness polling.

use std::future::Future;

use keel_core::config::{ReadinessConfig, RetryConfig};
use keel_platform::{ComputeService, Deployment, PlatformResult, UpdateStatus};
use tracing::{debug, warn};

use crate::error::{ReconcileError, ReconcileResult};

/// Run `call`, retrying transient platform errors with doubling delays.
/// Every other error is returned on first sight.
pub async fn with_backoff<T, F, Fut>(policy: &RetryConfig, op: &str, mut call: F) -> PlatformResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PlatformResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(op, attempt, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll until the function's last update has finished.
pub async fn wait_until_settled(
    compute: &dyn ComputeService,
    policy: &ReadinessConfig,
    name: &str,
) -> ReconcileResult<Deployment> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let function = compute
            .get_function(name)
            .await?
            .ok_or_else(|| ReconcileError::DeploymentNotFound(name.to_string()))?;
        match function.update_status {
            UpdateStatus::Successful => return Ok(function),
            UpdateStatus::Failed => return Err(ReconcileError::UpdateFailed(name.to_string())),
            UpdateStatus::InProgress => {
                debug!(function = name, attempt, "waiting for update to finish");
                if attempt < attempts {
                    tokio::time::sleep(policy.interval()).await;
                }
            }
        }
    }
    Err(ReconcileError::NotReady {
        function: name.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_platform::PlatformError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&policy(3), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PlatformError::Transient("throttled".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: PlatformResult<()> = with_backoff(&policy(3), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PlatformError::Transient("throttled".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: PlatformResult<()> = with_backoff(&policy(5), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PlatformError::Other("denied".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
