//! Bounded wait for an instance to report the active status.
//!
//! The poller turns the provider's open-ended boot process into a wait with
//! a fixed upper bound. With a poll interval `P` and a timeout `T` it makes
//! at most `ceil(T / P)` attempts. Errors returned by an individual poll are
//! surfaced immediately and are never reinterpreted as a timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LambdaConfig;
use crate::provider::{Instance, InstanceStatus, Provider};

/// Errors raised while waiting for an instance to become active.
#[derive(Debug, Error)]
pub enum WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the active status was not observed in time.
    #[error("instance {instance_id} did not become active within {}s", .elapsed.as_secs())]
    Timeout {
        /// Instance that was being polled.
        instance_id: String,
        /// Time spent waiting; never less than the configured timeout.
        elapsed: Duration,
    },
    /// Raised when a poll attempt fails.
    #[error("failed to poll instance status: {0}")]
    Provider(#[source] E),
    /// Raised when the caller cancels the wait.
    #[error("wait for instance {instance_id} was cancelled")]
    Cancelled {
        /// Instance that was being polled.
        instance_id: String,
    },
}

/// Polls a provider until an instance is active or the timeout elapses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessPoller {
    poll_interval: Duration,
    timeout: Duration,
}

impl ReadinessPoller {
    /// Creates a poller with an explicit schedule.
    #[must_use]
    pub const fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Creates a poller using the configured interval and timeout.
    #[must_use]
    pub const fn from_config(config: &LambdaConfig) -> Self {
        Self::new(config.poll_interval(), config.wait_timeout())
    }

    /// Interval slept between attempts.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Upper bound on the wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits until `instance_id` reports `active` and returns that snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] when the timeout elapses first and
    /// [`WaitError::Provider`] as soon as any poll fails.
    pub async fn wait_until_active<P>(
        &self,
        provider: &P,
        instance_id: &str,
    ) -> Result<Instance, WaitError<P::Error>>
    where
        P: Provider + Sync,
    {
        self.wait_until_active_or_cancelled(provider, instance_id, &CancellationToken::new())
            .await
    }

    /// Like [`Self::wait_until_active`] but also stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Cancelled`] when the token is cancelled, in
    /// addition to the errors of [`Self::wait_until_active`].
    pub async fn wait_until_active_or_cancelled<P>(
        &self,
        provider: &P,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance, WaitError<P::Error>>
    where
        P: Provider + Sync,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let cancelled = || WaitError::Cancelled {
            instance_id: instance_id.to_owned(),
        };

        loop {
            attempt = attempt.saturating_add(1);
            let instance = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                polled = provider.get_instance(instance_id) => {
                    polled.map_err(WaitError::Provider)?
                }
            };

            if instance.status == InstanceStatus::Active {
                info!(
                    instance_id,
                    attempt,
                    elapsed_secs = started.elapsed().as_secs(),
                    "instance is active"
                );
                return Ok(instance);
            }
            debug!(instance_id, attempt, status = %instance.status, "instance not active yet");

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                () = sleep(self.poll_interval) => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::Timeout {
                    instance_id: instance_id.to_owned(),
                    elapsed,
                });
            }
        }
    }
}
