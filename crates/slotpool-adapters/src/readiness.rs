//! Bounded-retry readiness probing.

use std::{future::Future, time::Duration};

use slotpool_core::AdapterError;

/// Probe `probe` until it reports ready, at most `attempts` times.
///
/// The probe returns `Ok(true)` once the surface is ready and `Ok(false)`
/// while it is not. A `Fatal` error aborts immediately; any other error
/// counts as a failed attempt.
///
/// # Errors
/// Returns `AdapterError::Fatal` if the surface is not ready after
/// `attempts` probes.
pub async fn wait_until_ready<F, Fut>(
    attempts: u32,
    interval: Duration,
    mut probe: F,
) -> Result<(), AdapterError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool, AdapterError>>,
{
    for attempt in 1..=attempts {
        match probe(attempt).await {
            Ok(true) => {
                tracing::debug!(attempt, "Surface ready");
                return Ok(());
            }
            Ok(false) => tracing::debug!(attempt, attempts, "Surface not ready yet"),
            Err(e @ AdapterError::Fatal(_)) => return Err(e),
            Err(e) => tracing::warn!(attempt, attempts, error = %e, "Readiness probe failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(AdapterError::Fatal(format!(
        "surface not ready after {attempts} attempts"
    )))
}
