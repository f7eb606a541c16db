//! Runs a local workload file on a ready instance over SSH.
//!
//! [`RemoteExecutor`] drives a fixed protocol against a [`RemoteSession`]:
//! upload the workload into the remote directory, start it with the
//! configured interpreter, then collect its buffered output and exit status.
//! Once a session has been opened it is closed exactly once, whichever step
//! fails. [`RemoteExecutor::execute_until_cancelled`] runs the same protocol
//! on a blocking worker and interrupts the session when cancelled.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod command;
mod config;
mod error;
mod host_keys;
mod ssh;

pub use config::{
    DEFAULT_KNOWN_HOSTS_FILE, DEFAULT_REMOTE_DIRECTORY, RemoteConfig, RemoteConfigError,
    expand_tilde,
};
pub use error::{ExecuteError, ExecutionPhase, RemoteExecutionError, SessionError};
pub use host_keys::HostKeyPolicy;
pub use ssh::{Ssh2Connector, Ssh2Session};

/// Output captured from a remote workload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Everything the workload wrote to standard output.
    pub stdout: String,
    /// Everything the workload wrote to standard error.
    pub stderr: String,
    /// Exit status reported by the remote shell, when one was delivered.
    pub exit_status: Option<i32>,
}

impl ExecutionResult {
    /// Returns `true` when the workload reported exit status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }
}

/// Aborts a session's blocking I/O from another thread.
///
/// Firing the interrupt makes any in-flight upload, start, or collect return
/// an error promptly; the executor still closes the session afterwards.
pub struct SessionInterrupt(Box<dyn Fn() + Send + Sync>);

impl SessionInterrupt {
    /// Wraps the action that breaks the session's transport.
    #[must_use]
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(action))
    }

    /// Fires the interrupt. Firing more than once is harmless.
    pub fn fire(&self) {
        (self.0)();
    }
}

impl fmt::Debug for SessionInterrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionInterrupt")
    }
}

/// One open remote shell session.
///
/// Implementations are driven in order: [`upload`](Self::upload),
/// [`start`](Self::start), [`collect`](Self::collect), and finally
/// [`close`](Self::close), which the executor calls on every path.
pub trait RemoteSession {
    /// Writes `contents` to `remote_path` over a file-transfer channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the transfer fails.
    fn upload(&mut self, remote_path: &Utf8Path, contents: &[u8]) -> Result<(), SessionError>;

    /// Starts `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the command cannot be started.
    fn start(&mut self, command: &str) -> Result<(), SessionError>;

    /// Blocks until the started command exits and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the output cannot be read.
    fn collect(&mut self) -> Result<ExecutionResult, SessionError>;

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the disconnect fails.
    fn close(&mut self) -> Result<(), SessionError>;

    /// Returns a handle that aborts this session's blocking I/O from another
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the transport cannot be shared.
    fn interrupter(&self) -> Result<SessionInterrupt, SessionError>;
}

/// Opens [`RemoteSession`]s to an address.
pub trait SessionConnector {
    /// Session type produced by this connector.
    type Session: RemoteSession;

    /// Connects, verifies the host, and authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when any connection step fails.
    fn connect(&self, address: IpAddr) -> Result<Self::Session, SessionError>;
}

/// Transfers and runs workloads through a [`SessionConnector`].
#[derive(Clone, Debug)]
pub struct RemoteExecutor<C> {
    connector: C,
    interpreter: String,
}

impl RemoteExecutor<Ssh2Connector> {
    /// Convenience constructor that wires the `ssh2` connector.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigError`] when validation fails.
    pub fn with_ssh(config: &RemoteConfig) -> Result<Self, RemoteConfigError> {
        Ok(Self::new(
            Ssh2Connector::from_config(config)?,
            config.interpreter.trim(),
        ))
    }
}

/// Workload read from disk together with where and how it will run.
#[derive(Debug)]
struct PreparedWorkload {
    remote_path: Utf8PathBuf,
    contents: Vec<u8>,
    command: String,
}

/// Hands a session's interrupt to the task waiting on cancellation.
#[derive(Debug)]
struct InterruptSlot {
    interrupt: Mutex<Option<SessionInterrupt>>,
    cancel: CancellationToken,
}

impl InterruptSlot {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            interrupt: Mutex::new(None),
            cancel,
        }
    }

    /// Publishes the session's interrupt, then refuses to continue when
    /// cancellation already fired.
    fn arm<S: RemoteSession>(&self, session: &S) -> Result<(), RemoteExecutionError> {
        let interrupt = session
            .interrupter()
            .map_err(|err| err.in_phase(ExecutionPhase::Connect))?;
        *self
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(interrupt);
        if self.cancel.is_cancelled() {
            return Err(RemoteExecutionError::new(
                ExecutionPhase::Execute,
                "cancelled before the workload started",
            ));
        }
        Ok(())
    }

    fn fire(&self) {
        if let Some(interrupt) = self
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            interrupt.fire();
        }
    }
}

impl<C: SessionConnector> RemoteExecutor<C> {
    /// Creates an executor that runs workloads with `interpreter`.
    #[must_use]
    pub fn new(connector: C, interpreter: impl Into<String>) -> Self {
        Self {
            connector,
            interpreter: interpreter.into(),
        }
    }

    /// Returns the connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Uploads `workload` into `remote_directory` on `address`, runs it, and
    /// returns the captured output.
    ///
    /// The local file is read before any connection is attempted. A failure
    /// to close the session after a successful run is logged and does not
    /// discard the result.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecutionError`] tagged with the failing phase.
    pub fn execute(
        &self,
        address: IpAddr,
        workload: &Utf8Path,
        remote_directory: &Utf8Path,
    ) -> Result<ExecutionResult, RemoteExecutionError> {
        let prepared = self.prepare(workload, remote_directory)?;
        run_session(&self.connector, address, &prepared, None)
    }

    fn prepare(
        &self,
        workload: &Utf8Path,
        remote_directory: &Utf8Path,
    ) -> Result<PreparedWorkload, RemoteExecutionError> {
        let remote_path = command::remote_workload_path(remote_directory, workload).ok_or_else(
            || {
                RemoteExecutionError::new(
                    ExecutionPhase::Transfer,
                    format!("workload path has no file name: {workload}"),
                )
            },
        )?;
        let contents = command::read_workload(workload)
            .map_err(|message| RemoteExecutionError::new(ExecutionPhase::Transfer, message))?;
        let remote_command =
            command::build_command(remote_directory, &self.interpreter, &remote_path);
        Ok(PreparedWorkload {
            remote_path,
            contents,
            command: remote_command,
        })
    }
}

impl<C> RemoteExecutor<C>
where
    C: SessionConnector + Clone + Send + 'static,
    C::Session: Send,
{
    /// Runs [`Self::execute`] on a blocking worker and stops when `cancel`
    /// fires.
    ///
    /// On cancellation the session's transport is interrupted and the worker
    /// is awaited, so the session has been closed exactly once before this
    /// returns. A workload that finished before the interrupt took effect
    /// still returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Cancelled`] when `cancel` fired first and
    /// [`ExecuteError::Remote`] for any other failure.
    pub async fn execute_until_cancelled(
        &self,
        address: IpAddr,
        workload: &Utf8Path,
        remote_directory: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        let prepared = self.prepare(workload, remote_directory)?;
        let slot = Arc::new(InterruptSlot::new(cancel.clone()));
        let mut worker = tokio::task::spawn_blocking({
            let connector = self.connector.clone();
            let worker_slot = Arc::clone(&slot);
            move || run_session(&connector, address, &prepared, Some(worker_slot.as_ref()))
        });

        tokio::select! {
            biased;
            joined = &mut worker => flatten(joined).map_err(ExecuteError::from),
            () = cancel.cancelled() => {
                warn!(%address, "cancelling remote execution");
                slot.fire();
                match flatten(worker.await) {
                    Ok(result) => Ok(result),
                    Err(err) => {
                        debug!(%address, error = %err, "remote execution stopped");
                        Err(ExecuteError::Cancelled)
                    }
                }
            }
        }
    }
}

fn flatten(
    joined: Result<Result<ExecutionResult, RemoteExecutionError>, tokio::task::JoinError>,
) -> Result<ExecutionResult, RemoteExecutionError> {
    joined.unwrap_or_else(|err| {
        Err(RemoteExecutionError::new(
            ExecutionPhase::Execute,
            format!("execution worker failed: {err}"),
        ))
    })
}

fn run_session<C: SessionConnector>(
    connector: &C,
    address: IpAddr,
    prepared: &PreparedWorkload,
    slot: Option<&InterruptSlot>,
) -> Result<ExecutionResult, RemoteExecutionError> {
    let mut session = connector
        .connect(address)
        .map_err(|err| err.in_phase(ExecutionPhase::Connect))?;
    let outcome = slot
        .map_or(Ok(()), |armed| armed.arm(&session))
        .and_then(|()| run_workload(&mut session, prepared));
    let closed = session.close();

    match (outcome, closed) {
        (Ok(result), Ok(())) => Ok(result),
        (Ok(result), Err(err)) => {
            warn!(%address, error = %err, "failed to close session after workload finished");
            Ok(result)
        }
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(%address, error = %close_err, "failed to close session after error");
            Err(err)
        }
    }
}

fn run_workload<S: RemoteSession>(
    session: &mut S,
    prepared: &PreparedWorkload,
) -> Result<ExecutionResult, RemoteExecutionError> {
    session
        .upload(&prepared.remote_path, &prepared.contents)
        .map_err(|err| err.in_phase(ExecutionPhase::Transfer))?;
    debug!(command = %prepared.command, "starting workload");
    session
        .start(&prepared.command)
        .map_err(|err| err.in_phase(ExecutionPhase::Execute))?;
    let result = session
        .collect()
        .map_err(|err| err.in_phase(ExecutionPhase::ReadOutput))?;
    info!(exit_status = ?result.exit_status, "workload finished");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedConnector, SessionStep};
    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    const ADDRESS: [u8; 4] = [1, 2, 3, 4];

    struct Workload {
        _dir: TempDir,
        path: Utf8PathBuf,
    }

    #[fixture]
    fn workload() -> Workload {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test_train.py")).expect("utf8");
        std::fs::write(&path, "print('Training complete!')\n").expect("write workload");
        Workload { _dir: dir, path }
    }

    fn executor(connector: &ScriptedConnector) -> RemoteExecutor<ScriptedConnector> {
        RemoteExecutor::new(connector.clone(), "python3")
    }

    #[rstest]
    fn uploads_runs_and_closes_once(workload: Workload) {
        let connector = ScriptedConnector::new().with_result(ExecutionResult {
            stdout: String::from("Training complete!\nFinal loss: 0.1000\n"),
            stderr: String::new(),
            exit_status: Some(0),
        });

        let result = executor(&connector)
            .execute(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
            )
            .expect("execution should succeed");

        assert!(result.stdout.contains("Final loss: 0.1000"));
        assert!(result.succeeded());
        assert_eq!(connector.connections(), vec![IpAddr::from(ADDRESS)]);
        let uploads = connector.uploads();
        let (path, contents) = uploads.first().expect("one upload");
        assert_eq!(path, "/home/ubuntu/test_train.py");
        assert_eq!(contents, b"print('Training complete!')\n");
        assert_eq!(
            connector.commands(),
            vec![String::from(
                "cd /home/ubuntu && python3 /home/ubuntu/test_train.py"
            )]
        );
        assert_eq!(connector.close_count(), 1);
    }

    #[rstest]
    #[case(SessionStep::Upload, ExecutionPhase::Transfer)]
    #[case(SessionStep::Start, ExecutionPhase::Execute)]
    #[case(SessionStep::Collect, ExecutionPhase::ReadOutput)]
    fn failing_step_still_closes_once(
        workload: Workload,
        #[case] step: SessionStep,
        #[case] phase: ExecutionPhase,
    ) {
        let connector = ScriptedConnector::new().fail_at(step, "channel reset");

        let error = executor(&connector)
            .execute(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
            )
            .expect_err("execution should fail");

        assert_eq!(error.phase, phase);
        assert!(error.message.contains("channel reset"));
        assert_eq!(connector.close_count(), 1);
    }

    #[rstest]
    fn close_failure_after_success_keeps_result(workload: Workload) {
        let connector = ScriptedConnector::new()
            .with_result(ExecutionResult {
                stdout: String::from("ok\n"),
                stderr: String::new(),
                exit_status: Some(0),
            })
            .fail_at(SessionStep::Close, "eof");

        let result = executor(&connector)
            .execute(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
            )
            .expect("close failure must not discard the result");

        assert_eq!(result.stdout, "ok\n");
        assert_eq!(connector.close_count(), 1);
    }

    #[rstest]
    fn connect_failure_opens_no_session(workload: Workload) {
        let connector = ScriptedConnector::new().fail_connect("connection refused");

        let error = executor(&connector)
            .execute(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
            )
            .expect_err("connect should fail");

        assert_eq!(error.phase, ExecutionPhase::Connect);
        assert_eq!(connector.close_count(), 0);
    }

    #[test]
    fn missing_workload_fails_before_connecting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = Utf8PathBuf::from_path_buf(dir.path().join("absent.py")).expect("utf8");
        let connector = ScriptedConnector::new();

        let error = executor(&connector)
            .execute(IpAddr::from(ADDRESS), &missing, Utf8Path::new("/home/ubuntu"))
            .expect_err("missing workload should fail");

        assert_eq!(error.phase, ExecutionPhase::Transfer);
        assert!(connector.connections().is_empty());
        assert_eq!(connector.close_count(), 0);
    }

    #[test]
    fn non_zero_exit_is_captured_not_raised() {
        let result = ExecutionResult {
            stdout: String::new(),
            stderr: String::from("Traceback"),
            exit_status: Some(1),
        };
        assert!(!result.succeeded());
        assert!(!ExecutionResult::default().succeeded());
    }

    #[rstest]
    #[tokio::test]
    async fn cancellable_execution_returns_the_result(workload: Workload) {
        let executor = executor(&ScriptedConnector::new());

        let result = executor
            .execute_until_cancelled(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
                &CancellationToken::new(),
            )
            .await
            .expect("execution should succeed");

        assert!(result.succeeded());
        assert_eq!(executor.connector().close_count(), 1);
        assert_eq!(executor.connector().interrupt_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn cancelled_before_start_runs_nothing(workload: Workload) {
        let executor = executor(&ScriptedConnector::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = executor
            .execute_until_cancelled(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
                &cancel,
            )
            .await
            .expect_err("execution should be cancelled");

        assert_eq!(error, ExecuteError::Cancelled);
        assert!(executor.connector().commands().is_empty());
        assert_eq!(executor.connector().close_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_collect(workload: Workload) {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new().hang_collect_and_cancel(&cancel);

        let error = executor(&connector)
            .execute_until_cancelled(
                IpAddr::from(ADDRESS),
                &workload.path,
                Utf8Path::new("/home/ubuntu"),
                &cancel,
            )
            .await
            .expect_err("execution should be cancelled");

        assert_eq!(error, ExecuteError::Cancelled);
        assert_eq!(connector.commands().len(), 1);
        assert_eq!(connector.interrupt_count(), 1);
        assert_eq!(connector.close_count(), 1);
    }
}
