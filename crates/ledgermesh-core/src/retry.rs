//! Exponential-backoff retry engine.
//!
//! This is the single place in the system that sleeps between attempts;
//! every blocking loop funnels its transient failures through
//! [`Retry::run`] so cancellation is handled uniformly. Operations
//! classify their own failures: transient errors come back as
//! [`Attempt::Again`], permanent ones as [`Attempt::Fatal`], and
//! swallowable per-item failures never reach the retry engine at all.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::shutdown::ShutdownSignal;

/// Outcome of a single retried attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The operation finished; stop retrying.
    Done(T),

    /// Transient failure; sleep and run again.
    Again(E),

    /// Permanent failure; surface the error without another attempt.
    Fatal(E),
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Shutdown was requested before the operation finished.
    #[error("retry canceled by shutdown")]
    Canceled,

    /// The operation reported a permanent failure.
    #[error("{0}")]
    Op(E),
}

/// Exponential backoff policy: attempt `n` fails, sleep
/// `min(initial_delay * factor^(n-1), maximum_delay)`, try again.
#[derive(Debug, Clone)]
pub struct Retry {
    pub initial_delay: Duration,
    pub maximum_delay: Duration,
    pub factor: f64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            maximum_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl Retry {
    /// Runs `op` until it returns [`Attempt::Done`] or [`Attempt::Fatal`],
    /// sleeping between attempts. The attempt counter passed to `op`
    /// starts at 1.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Canceled`] as soon as `shutdown` fires -
    /// including mid-sleep - or [`RetryError::Op`] for a fatal failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        shutdown: &ShutdownSignal,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Err(RetryError::Canceled);
            }
            attempt += 1;
            match op(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(err) => return Err(RetryError::Op(err)),
                Attempt::Again(err) => {
                    let delay = self.delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.cancelled() => return Err(RetryError::Canceled),
                    }
                }
            }
        }
    }

    /// The sleep before re-running attempt `attempt + 1`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64()
            * self.factor.powi(attempt.saturating_sub(1).min(64) as i32);
        if exp.is_finite() {
            self.maximum_delay.min(Duration::from_secs_f64(exp.max(0.0)))
        } else {
            self.maximum_delay
        }
    }
}
