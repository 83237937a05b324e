//! Bounded polling for external resources

use crate::error::{MigrationError, MigrationResult};

use convhost_common::PollBudget;
use std::future::Future;
use tracing::debug;

/// Probe until it yields a value, at most `budget.attempts` times with
/// `budget.delay()` between probes. Probe errors end the wait immediately.
pub async fn wait_for<T, E, F, Fut>(what: &str, budget: PollBudget, mut probe: F) -> MigrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    MigrationError: From<E>,
{
    for attempt in 1..=budget.attempts {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        debug!("Waiting for {what}: attempt {attempt}/{}", budget.attempts);
        if attempt < budget.attempts {
            tokio::time::sleep(budget.delay()).await;
        }
    }
    Err(MigrationError::Timeout {
        what: what.to_string(),
        attempts: budget.attempts,
    })
}

/// [`wait_for`] over a boolean condition
pub async fn wait_until<E, F, Fut>(what: &str, budget: PollBudget, mut probe: F) -> MigrationResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    MigrationError: From<E>,
{
    wait_for(what, budget, || {
        let ready = probe();
        async move { ready.await.map(|ok| ok.then_some(())) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use convhost_provider::ProviderError;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_probes() {
        let start = tokio::time::Instant::now();
        let mut probes = 0;
        wait_until("disk", PollBudget::new(10, 15), || {
            probes += 1;
            let ready = probes == 3;
            async move { Ok::<_, ProviderError>(ready) }
        })
        .await
        .unwrap();
        assert_eq!(probes, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let start = tokio::time::Instant::now();
        let mut probes = 0u32;
        let err = wait_until("detach of disk d1", PollBudget::new(4, 5), || {
            probes += 1;
            async { Ok::<_, ProviderError>(false) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::Timeout { attempts: 4, .. }));
        assert_eq!(probes, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_probe_error_stops_waiting() {
        let err = wait_for("path", PollBudget::new(5, 0), || async {
            Err::<Option<u8>, _>(ProviderError::NotFound("disk d1".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::Provider(ProviderError::NotFound(_))));
    }
}
