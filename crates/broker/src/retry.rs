//! Bounded startup retry
//!
//! Only process startup is retried here (waiting for the broker and its
//! topology to exist). Steady-state failures are handled by the consume loop.

use crate::{BrokerError, BrokerResult};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed-backoff retry policy
#[derive(Debug, Clone)]
pub struct StartupRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            max_attempts: std::env::var("STARTUP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            delay: Duration::from_secs(
                std::env::var("STARTUP_RETRY_DELAY_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted
///
/// # Errors
///
/// Returns [`BrokerError::StartupExhausted`] carrying the last error.
pub async fn retry_startup<T, F, Fut>(
    policy: &StartupRetry,
    what: &str,
    mut attempt: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for n in 1..=attempts {
        match attempt().await {
            Ok(value) => {
                if n > 1 {
                    info!("{} succeeded on attempt {}/{}", what, n, attempts);
                }
                return Ok(value);
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, n, attempts, e);
                last_error = e.to_string();
                if n < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(BrokerError::StartupExhausted {
        attempts,
        last_error,
    })
}
