//! Bounded retry loops
//!
//! Read-modify-write updates of shared records go through
//! [`retry_on_conflict`]: read the latest version, compute the new value,
//! write it conditionally and start over if someone else won the race.

use rand::Rng;
use std::time::Duration;
use tapeio_common::config::AccessRequestConfig;
use tapeio_common::{Error, Result};
use tracing::{debug, warn};

/// Number of attempts and randomized backoff between them
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AccessRequestConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &AccessRequestConfig) -> Self {
        Self {
            max_attempts: config.max_update_attempts.max(1),
            min_backoff: Duration::from_millis(config.retry_min_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }

    /// Policy retrying without waiting, for tests
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }
        rand::thread_rng().gen_range(self.min_backoff..=self.max_backoff)
    }
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Lost a race against a concurrent update; try again
    Conflict,
}

/// Run `attempt` until it is done, at most `policy.max_attempts` times.
///
/// Errors end the loop immediately. Running out of attempts is reported as
/// a concurrency error.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, what: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<Attempt<T>>,
{
    for n in 1..=policy.max_attempts {
        match attempt()? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Conflict if n < policy.max_attempts => {
                debug!("Conflict on {what} (attempt {n}/{}), retrying", policy.max_attempts);
                std::thread::sleep(policy.backoff());
            }
            Attempt::Conflict => {}
        }
    }
    warn!("Giving up {what} after {} conflicting attempts", policy.max_attempts);
    Err(Error::Concurrency(format!(
        "{what}: still conflicting after {} attempts",
        policy.max_attempts
    )))
}

/// Run `op` again while it fails with a retryable error
pub fn retry_transient<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut n = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && n < policy.max_attempts => {
                warn!("{what} failed (attempt {n}/{}): {e}", policy.max_attempts);
                std::thread::sleep(policy.backoff());
                n += 1;
            }
            result => return result,
        }
    }
}
