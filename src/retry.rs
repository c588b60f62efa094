use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Delay strategy applied between two consecutive polling attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(interval) => *interval,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Debug)]
pub enum PollError<E> {
    Timeout {
        elapsed: Duration,
        attempts: u32,
        last_error: Option<E>,
    },
}

impl<E> PollError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            PollError::Timeout { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            PollError::Timeout { last_error, .. } => last_error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Timeout {
                elapsed,
                attempts,
                last_error,
            } => {
                write!(f, "condition not met after {elapsed:?} ({attempts} attempts)")?;
                if let Some(err) = last_error {
                    write!(f, ", last error: {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PollError<E> {}

/// Awaits `check` until it succeeds or `timeout` elapses, sleeping according to `backoff` between attempts.
///
/// At least one attempt is always performed. An attempt still pending at the deadline is dropped and no sleep goes
/// past it, so the whole call is bounded by `timeout`.
pub async fn poll_until<F, Fut, T, E>(
    timeout: Duration,
    backoff: Backoff,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0;
    let mut last_error = None;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, check()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => last_error = Some(err),
            // cut at the deadline, keep the error of the previous attempt
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                elapsed: now - start,
                attempts,
                last_error,
            });
        }
        sleep(backoff.delay(attempts).min(deadline - now)).await;
    }
}

/// Eventual-consistency helper meant for assertions inside test cases: retries `check` every `interval`
/// until it passes or `timeout` elapses.
pub async fn eventually<F, Fut, T, E>(
    timeout: Duration,
    interval: Duration,
    check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    poll_until(timeout, Backoff::Fixed(interval), check).await
}
