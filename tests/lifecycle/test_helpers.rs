//! Shared fixtures for lifecycle BDD scenarios.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use gpurun::test_support::{ScriptedConnector, ScriptedProvider};
use gpurun::{
    DEFAULT_REMOTE_DIRECTORY, LambdaError, LifecycleError, LifecycleOrchestrator, LifecycleReport,
    ReadinessPoller, RemoteExecutor, TeardownOutcome,
};
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::{Builder, Runtime};

/// Interval between readiness polls in the scenarios.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Readiness deadline in the scenarios.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

const TRAINING_SCRIPT: &str = include_str!("../fixtures/test_train.py");

pub struct LifecycleContext {
    pub provider: RefCell<ScriptedProvider>,
    pub connector: RefCell<ScriptedConnector>,
    pub outcome: RefCell<Option<Result<LifecycleReport, LifecycleError<LambdaError>>>>,
    pub terminations: RefCell<Vec<TeardownOutcome>>,
    pub workload_dir: Utf8PathBuf,
    _workload_tmp: Arc<TempDir>,
}

impl LifecycleContext {
    pub fn orchestrator(&self) -> LifecycleOrchestrator<ScriptedProvider, ScriptedConnector> {
        LifecycleOrchestrator::new(
            self.provider.borrow().clone(),
            ReadinessPoller::new(POLL_INTERVAL, WAIT_TIMEOUT),
            RemoteExecutor::new(self.connector.borrow().clone(), "python3"),
            DEFAULT_REMOTE_DIRECTORY,
        )
    }

    /// Copies the training fixture into the scenario workspace.
    pub fn stage_workload(&self, name: &str) -> Utf8PathBuf {
        let path = self.workload_dir.join(name);
        std::fs::write(&path, TRAINING_SCRIPT)
            .unwrap_or_else(|err| panic!("write workload {path}: {err}"));
        path
    }
}

/// Builds a current-thread runtime whose clock only advances while idle, so
/// readiness timeouts elapse instantly.
pub fn paused_runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap_or_else(|err| panic!("runtime should build: {err}"))
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let workload_dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir path: {}", path.display()));
    LifecycleContext {
        provider: RefCell::new(ScriptedProvider::new()),
        connector: RefCell::new(ScriptedConnector::new()),
        outcome: RefCell::new(None),
        terminations: RefCell::new(Vec::new()),
        workload_dir,
        _workload_tmp: Arc::new(tmp),
    }
}
