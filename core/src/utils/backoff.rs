/// Exponential backoff with jitter for best-effort retries
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

const MAX_DELAY: Duration = Duration::from_secs(5);

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped, plus up to 50% random jitter.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}

/// Run `op` until it succeeds or `attempts` are used up, sleeping with
/// backoff between tries. Returns the last error on exhaustion.
pub async fn retry_with_backoff<T, E, F>(attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff_delay(attempt, base);
                debug!("Attempt {} failed ({}), retrying in {:?}", attempt + 1, e, delay);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(10);
        let first = backoff_delay(0, base);
        assert!(first >= base && first <= base + base / 2);

        let third = backoff_delay(2, base);
        assert!(third >= Duration::from_millis(40));

        let huge = backoff_delay(30, base);
        assert!(huge <= MAX_DELAY + MAX_DELAY / 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let result: Result<u32, String> = retry_with_backoff(5, Duration::from_millis(1), |attempt| {
            if attempt < 2 {
                Err(format!("busy {}", attempt))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(3, Duration::from_millis(1), |_| {
            calls += 1;
            Err("full")
        })
        .await;
        assert_eq!(result, Err("full"));
        assert_eq!(calls, 3);
    }
}
