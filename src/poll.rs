use std::future::Future;
use std::time::Duration;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error<E> {
    #[error("condition not reached after {attempts} attempts, {interval:?} apart")]
    TimedOut {
        attempts: u32,
        interval: Duration,
    },

    #[error("read status: {0}")]
    Read(E),
}

/// How often, and how many times, a condition is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Policy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_secs(interval_secs: u64, max_attempts: u32) -> Self {
        Self::new(Duration::from_secs(interval_secs), max_attempts)
    }
}

/// Call `predicate` until it reports `true`, at most `policy.max_attempts` times,
/// sleeping `policy.interval` between calls.
///
/// Only a `false` answer is retried. An error from `predicate` is returned
/// immediately as [`Error::Read`], distinct from [`Error::TimedOut`].
pub async fn wait_for<F, Fut, E>(policy: Policy, mut predicate: F) -> Result<(), Error<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    for attempt in 1..=policy.max_attempts {
        if predicate().await.map_err(Error::Read)? {
            debug!("Condition reached on attempt {attempt}/{}", policy.max_attempts);
            return Ok(());
        }
        debug!("Condition not reached on attempt {attempt}/{}", policy.max_attempts);
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(Error::TimedOut {
        attempts: policy.max_attempts,
        interval: policy.interval,
    })
}
