use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs `action` until it succeeds, the error is not retriable, or the
/// attempt budget is spent. Delays grow geometrically between attempts.
pub async fn with_retries<T, E, F, Fut>(
    description: &str,
    config: &RetryConfig,
    mut action: F,
    is_retriable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    let mut delay = config.min_delay;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                warn!(
                    "{description} failed (attempt {attempt}/{}), retrying in {delay:?}: {error}",
                    config.max_attempts
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, config);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    current.mul_f64(config.multiplier).min(config.max_delay)
}
