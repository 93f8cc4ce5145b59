use std::future::Future;
use std::time::Duration;

use anyhow::Result;

/// Verdict from a single attempt of a retryable operation.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation completed; stop retrying.
    Done(T),
    /// The operation hit a transient condition described by the message.
    Retry(String),
}

/// Run `op` up to `max_attempts` times, sleeping `base_delay * 2^n` between
/// attempts. The final transient failure is returned as an error.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let mut last_reason = String::new();
    for attempt in 0..max_attempts {
        match op(attempt).await? {
            Attempt::Done(v) => return Ok(v),
            Attempt::Retry(reason) => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                tracing::debug!("transient failure (attempt {attempt}): {reason}; retrying in {delay:?}");
                last_reason = reason;
                tokio::time::sleep(delay).await;
            }
        }
    }
    anyhow::bail!("operation failed after {max_attempts} attempts: {last_reason}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_retry_eventually_succeeds() -> Result<()> {
        let calls = Cell::new(0u32);
        let r = retry_with_backoff(5, Duration::from_millis(1), |_| {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Ok(Attempt::Retry("busy".into()))
                } else {
                    Ok(Attempt::Done(n))
                }
            }
        })
        .await?;
        assert_eq!(r, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let r: Result<()> = retry_with_backoff(2, Duration::from_millis(1), |_| async {
            Ok(Attempt::Retry("still busy".into()))
        })
        .await;
        let msg = format!("{:#}", r.unwrap_err());
        assert!(msg.contains("after 2 attempts"));
        assert!(msg.contains("still busy"));
    }

    #[tokio::test]
    async fn test_hard_error_propagates() {
        let r: Result<()> =
            retry_with_backoff(5, Duration::from_millis(1), |_| async { anyhow::bail!("boom") })
                .await;
        assert!(format!("{:#}", r.unwrap_err()).contains("boom"));
    }
}
