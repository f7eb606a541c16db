//! Drives one instance through launch, readiness, execution, and teardown.
//!
//! The lifecycle is a linear state machine:
//! `Requested -> Launching -> WaitingReady -> Executing -> (Terminating) -> Done`,
//! with a short-circuit to `Failed` from any state. Once a launch has been
//! accepted the instance is billable, so every failure after that point
//! reports the instance id and what happened to it. Termination only happens
//! when the configured [`TeardownPolicy`] asks for it.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::provider::{Instance, LaunchRequest, Provider};
use crate::readiness::{ReadinessPoller, WaitError};
use crate::remote::{
    ExecuteError, ExecutionResult, RemoteExecutionError, RemoteExecutor, SessionConnector,
};

/// Position of a lifecycle in its state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LifecycleState {
    /// The caller asked for a run.
    Requested,
    /// The launch request is in flight.
    Launching,
    /// Polling until the instance reports `active`.
    WaitingReady,
    /// The workload is running on the instance.
    Executing,
    /// Termination has been requested.
    Terminating,
    /// The lifecycle finished successfully.
    Done,
    /// The lifecycle stopped on an error.
    Failed,
}

impl LifecycleState {
    /// Lowercase label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Launching => "launching",
            Self::WaitingReady => "waiting_ready",
            Self::Executing => "executing",
            Self::Terminating => "terminating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the orchestrator terminates the instance it launched.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TeardownPolicy {
    /// Never terminate; the instance stays up for inspection or reuse.
    #[default]
    LeaveRunning,
    /// Terminate only when waiting or execution fails.
    TerminateOnFailure,
    /// Terminate after both success and failure.
    Always,
}

impl TeardownPolicy {
    const fn on_failure(self) -> bool {
        matches!(self, Self::TerminateOnFailure | Self::Always)
    }

    const fn on_success(self) -> bool {
        matches!(self, Self::Always)
    }
}

/// How a non-zero remote exit status is treated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExitStatusPolicy {
    /// Return the status in the report and let the caller decide.
    #[default]
    Report,
    /// Treat a non-zero status as a lifecycle failure.
    FailOnNonZero,
}

/// What happened to the instance at the end of a lifecycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TeardownOutcome {
    /// Termination was not requested.
    Skipped,
    /// The provider accepted the termination request.
    Terminated,
    /// The termination request failed; the instance may still be running.
    Failed(String),
}

impl fmt::Display for TeardownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => f.write_str("left running"),
            Self::Terminated => f.write_str("terminated"),
            Self::Failed(message) => write!(f, "termination failed: {message}"),
        }
    }
}

/// Result of a completed lifecycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleReport {
    /// Instance the workload ran on.
    pub instance_id: String,
    /// Instance snapshot observed when it became active.
    pub instance: Instance,
    /// Captured workload output.
    pub execution: ExecutionResult,
    /// What happened to the instance afterwards.
    pub teardown: TeardownOutcome,
}

/// Errors surfaced by the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the launch request fails; nothing was provisioned.
    #[error("failed to launch instance: {0}")]
    Launch(#[source] E),
    /// Raised when the instance did not become active.
    #[error("instance {instance_id} did not become ready: {message}")]
    Wait {
        /// Instance that was being waited on.
        instance_id: String,
        /// Failure description including the teardown outcome.
        message: String,
        /// What happened to the instance.
        teardown: TeardownOutcome,
        /// Underlying wait failure.
        #[source]
        source: WaitError<E>,
    },
    /// Raised when an active instance reports no public address.
    #[error("instance {instance_id} is active but has no public address ({teardown})")]
    MissingAddress {
        /// Instance without an address.
        instance_id: String,
        /// What happened to the instance.
        teardown: TeardownOutcome,
    },
    /// Raised when the workload could not be transferred or run.
    #[error("remote execution on instance {instance_id} failed: {message}")]
    Execute {
        /// Instance the workload targeted.
        instance_id: String,
        /// Failure description including the teardown outcome.
        message: String,
        /// What happened to the instance.
        teardown: TeardownOutcome,
        /// Underlying execution failure.
        #[source]
        source: RemoteExecutionError,
    },
    /// Raised when cancellation interrupts the running workload. The remote
    /// session has been closed.
    #[error("workload on instance {instance_id} was cancelled ({teardown})")]
    Cancelled {
        /// Instance the workload ran on.
        instance_id: String,
        /// What happened to the instance.
        teardown: TeardownOutcome,
    },
    /// Raised under [`ExitStatusPolicy::FailOnNonZero`] when the workload
    /// exits with a non-zero status.
    #[error("workload on instance {instance_id} exited with status {status} ({teardown})")]
    NonZeroExit {
        /// Instance the workload ran on.
        instance_id: String,
        /// Remote exit status.
        status: i32,
        /// Captured output of the failed workload.
        execution: Box<ExecutionResult>,
        /// What happened to the instance.
        teardown: TeardownOutcome,
    },
}

impl<E> LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// Instance affected by the failure, if one was launched.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Launch(_) => None,
            Self::Wait { instance_id, .. }
            | Self::MissingAddress { instance_id, .. }
            | Self::Execute { instance_id, .. }
            | Self::Cancelled { instance_id, .. }
            | Self::NonZeroExit { instance_id, .. } => Some(instance_id),
        }
    }

    /// Teardown outcome attached to the failure, if an instance existed.
    #[must_use]
    pub const fn teardown(&self) -> Option<&TeardownOutcome> {
        match self {
            Self::Launch(_) => None,
            Self::Wait { teardown, .. }
            | Self::MissingAddress { teardown, .. }
            | Self::Execute { teardown, .. }
            | Self::Cancelled { teardown, .. }
            | Self::NonZeroExit { teardown, .. } => Some(teardown),
        }
    }
}

/// Composes a provider, a readiness poller, and a remote executor into the
/// caller-facing lifecycle.
#[derive(Debug)]
pub struct LifecycleOrchestrator<P, C> {
    provider: P,
    poller: ReadinessPoller,
    executor: RemoteExecutor<C>,
    remote_directory: Utf8PathBuf,
    teardown: TeardownPolicy,
    exit_status: ExitStatusPolicy,
    cancel: CancellationToken,
}

impl<P, C> LifecycleOrchestrator<P, C>
where
    P: Provider + Sync,
    C: SessionConnector + Clone + Send + 'static,
    C::Session: Send,
{
    /// Creates an orchestrator with the default policies: leave the instance
    /// running and report the exit status.
    #[must_use]
    pub fn new(
        provider: P,
        poller: ReadinessPoller,
        executor: RemoteExecutor<C>,
        remote_directory: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            provider,
            poller,
            executor,
            remote_directory: remote_directory.into(),
            teardown: TeardownPolicy::default(),
            exit_status: ExitStatusPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the teardown policy.
    #[must_use]
    pub const fn with_teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown = policy;
        self
    }

    /// Overrides the exit status policy.
    #[must_use]
    pub const fn with_exit_status_policy(mut self, policy: ExitStatusPolicy) -> Self {
        self.exit_status = policy;
        self
    }

    /// Uses `token` to abort the readiness wait or the running workload.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Launches an instance, waits for it, runs `workload`, and applies the
    /// teardown policy.
    ///
    /// Every call launches a new instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] describing the failing step and, once an
    /// instance exists, its id and teardown outcome.
    pub async fn run(
        &self,
        request: &LaunchRequest,
        workload: &Utf8Path,
    ) -> Result<LifecycleReport, LifecycleError<P::Error>> {
        transition(LifecycleState::Requested, None);
        transition(LifecycleState::Launching, None);
        let instance_id = match self.provider.launch(request).await {
            Ok(id) => id,
            Err(err) => {
                transition(LifecycleState::Failed, None);
                return Err(LifecycleError::Launch(err));
            }
        };
        info!(
            instance_id = %instance_id,
            region = %request.region,
            instance_type = %request.instance_type,
            "launch accepted"
        );
        self.drive(instance_id, workload).await
    }

    /// Runs `workload` on an instance that was launched earlier.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] as for [`Self::run`], except
    /// [`LifecycleError::Launch`].
    pub async fn exec_on(
        &self,
        instance_id: &str,
        workload: &Utf8Path,
    ) -> Result<LifecycleReport, LifecycleError<P::Error>> {
        self.drive(instance_id.to_owned(), workload).await
    }

    /// Requests termination of `instance_id`.
    ///
    /// Failures are logged and returned as [`TeardownOutcome::Failed`]; they
    /// never abort the caller.
    pub async fn terminate(&self, instance_id: &str) -> TeardownOutcome {
        transition(LifecycleState::Terminating, Some(instance_id));
        match self.provider.terminate(instance_id).await {
            Ok(()) => {
                info!(instance_id, "instance terminated");
                TeardownOutcome::Terminated
            }
            Err(err) => {
                warn!(instance_id, error = %err, "termination failed");
                TeardownOutcome::Failed(err.to_string())
            }
        }
    }

    async fn drive(
        &self,
        instance_id: String,
        workload: &Utf8Path,
    ) -> Result<LifecycleReport, LifecycleError<P::Error>> {
        transition(LifecycleState::WaitingReady, Some(&instance_id));
        let instance = match self
            .poller
            .wait_until_active_or_cancelled(&self.provider, &instance_id, &self.cancel)
            .await
        {
            Ok(instance) => instance,
            Err(err) => {
                let teardown = self.teardown_after_failure(&instance_id).await;
                return Err(LifecycleError::Wait {
                    message: append_teardown_note(err.to_string(), &teardown),
                    instance_id,
                    teardown,
                    source: err,
                });
            }
        };

        let Some(address) = instance.ready_address() else {
            let teardown = self.teardown_after_failure(&instance_id).await;
            return Err(LifecycleError::MissingAddress {
                instance_id,
                teardown,
            });
        };

        transition(LifecycleState::Executing, Some(&instance_id));
        let execution = match self
            .executor
            .execute_until_cancelled(address, workload, &self.remote_directory, &self.cancel)
            .await
        {
            Ok(execution) => execution,
            Err(ExecuteError::Cancelled) => {
                let teardown = self.teardown_after_failure(&instance_id).await;
                return Err(LifecycleError::Cancelled {
                    instance_id,
                    teardown,
                });
            }
            Err(ExecuteError::Remote(err)) => {
                let teardown = self.teardown_after_failure(&instance_id).await;
                return Err(LifecycleError::Execute {
                    message: append_teardown_note(err.to_string(), &teardown),
                    instance_id,
                    teardown,
                    source: err,
                });
            }
        };

        if let Some(status) = self.failing_status(&execution) {
            let teardown = self.teardown_after_failure(&instance_id).await;
            return Err(LifecycleError::NonZeroExit {
                instance_id,
                status,
                execution: Box::new(execution),
                teardown,
            });
        }

        let teardown = if self.teardown.on_success() {
            self.terminate(&instance_id).await
        } else {
            TeardownOutcome::Skipped
        };
        transition(LifecycleState::Done, Some(&instance_id));

        Ok(LifecycleReport {
            instance_id,
            instance,
            execution,
            teardown,
        })
    }

    fn failing_status(&self, execution: &ExecutionResult) -> Option<i32> {
        match (self.exit_status, execution.exit_status) {
            (ExitStatusPolicy::FailOnNonZero, Some(status)) if status != 0 => Some(status),
            _ => None,
        }
    }

    async fn teardown_after_failure(&self, instance_id: &str) -> TeardownOutcome {
        let outcome = if self.teardown.on_failure() {
            self.terminate(instance_id).await
        } else {
            info!(instance_id, "leaving instance running for inspection");
            TeardownOutcome::Skipped
        };
        transition(LifecycleState::Failed, Some(instance_id));
        outcome
    }
}

fn transition(state: LifecycleState, instance_id: Option<&str>) {
    info!(
        state = %state,
        instance_id = instance_id.unwrap_or("pending"),
        "lifecycle transition"
    );
}

fn append_teardown_note(message: String, teardown: &TeardownOutcome) -> String {
    match teardown {
        TeardownOutcome::Skipped => format!("{message} (instance left running)"),
        TeardownOutcome::Terminated => format!("{message} (instance terminated)"),
        TeardownOutcome::Failed(err) => format!("{message} (teardown also failed: {err})"),
    }
}
