//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::lambda::LambdaError;
use crate::provider::{Catalog, Instance, InstanceStatus, LaunchRequest, Provider, ProviderFuture};
use crate::remote::{
    ExecutionResult, RemoteSession, SessionConnector, SessionError, SessionInterrupt,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct ProviderState {
    launch_id: String,
    launch_error: Option<LambdaError>,
    booting_polls: Option<usize>,
    ip: Option<IpAddr>,
    catalog: Catalog,
    get_failures: BTreeMap<usize, LambdaError>,
    terminate_failures: BTreeMap<usize, LambdaError>,
    launches: Vec<LaunchRequest>,
    get_calls: usize,
    terminate_calls: Vec<String>,
    terminated: BTreeSet<String>,
}

/// In-memory [`Provider`] whose instance status follows a script.
///
/// By default a launch returns `i-123`, the instance is active on the first
/// poll at `1.2.3.4`, and terminating an id that was already terminated
/// yields a 404 [`LambdaError::Api`]. Clones share state, so a test can keep
/// one handle for assertions while the orchestrator owns another.
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Creates a provider with the default script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                launch_id: String::from("i-123"),
                launch_error: None,
                booting_polls: Some(0),
                ip: Some(IpAddr::from([1, 2, 3, 4])),
                catalog: Catalog::new(),
                get_failures: BTreeMap::new(),
                terminate_failures: BTreeMap::new(),
                launches: Vec::new(),
                get_calls: 0,
                terminate_calls: Vec::new(),
                terminated: BTreeSet::new(),
            })),
        }
    }

    /// Sets the id returned by `launch`.
    #[must_use]
    pub fn with_launch_id(self, id: &str) -> Self {
        lock(&self.state).launch_id = id.to_owned();
        self
    }

    /// Reports `booting` for the first `polls` calls, then `active`.
    #[must_use]
    pub fn active_after(self, polls: usize) -> Self {
        lock(&self.state).booting_polls = Some(polls);
        self
    }

    /// Reports `booting` forever.
    #[must_use]
    pub fn never_active(self) -> Self {
        lock(&self.state).booting_polls = None;
        self
    }

    /// Sets the address reported once the instance is active.
    #[must_use]
    pub fn with_ip(self, ip: IpAddr) -> Self {
        lock(&self.state).ip = Some(ip);
        self
    }

    /// Reports no address even when active.
    #[must_use]
    pub fn without_ip(self) -> Self {
        lock(&self.state).ip = None;
        self
    }

    /// Sets the catalogue returned by `list_instance_types`.
    #[must_use]
    pub fn with_catalog(self, catalog: Catalog) -> Self {
        lock(&self.state).catalog = catalog;
        self
    }

    /// Makes every launch fail with `error`.
    #[must_use]
    pub fn fail_launch(self, error: LambdaError) -> Self {
        lock(&self.state).launch_error = Some(error);
        self
    }

    /// Makes the `call`-th `get_instance` (1-based) fail with `error`.
    #[must_use]
    pub fn fail_get_on(self, call: usize, error: LambdaError) -> Self {
        lock(&self.state).get_failures.insert(call, error);
        self
    }

    /// Makes the `call`-th `terminate` (1-based) fail with `error`.
    #[must_use]
    pub fn fail_terminate_on(self, call: usize, error: LambdaError) -> Self {
        lock(&self.state).terminate_failures.insert(call, error);
        self
    }

    /// Number of `get_instance` calls made so far, including failed ones.
    #[must_use]
    pub fn get_calls(&self) -> usize {
        lock(&self.state).get_calls
    }

    /// Launch requests received so far.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRequest> {
        lock(&self.state).launches.clone()
    }

    /// Ids passed to `terminate`, in call order, including failed calls.
    #[must_use]
    pub fn terminate_calls(&self) -> Vec<String> {
        lock(&self.state).terminate_calls.clone()
    }

    fn snapshot(state: &ProviderState, id: &str, polls_seen: usize) -> Instance {
        let active = state
            .booting_polls
            .is_some_and(|booting| polls_seen > booting);
        let status = if state.terminated.contains(id) {
            InstanceStatus::Terminated
        } else if active {
            InstanceStatus::Active
        } else {
            InstanceStatus::Booting
        };
        Instance {
            id: id.to_owned(),
            name: None,
            ip: if active { state.ip } else { None },
            status,
            region: Some(String::from("us-east-1")),
            instance_type: Some(String::from("gpu_1x_a10")),
        }
    }
}

impl Provider for ScriptedProvider {
    type Error = LambdaError;

    fn list_instance_types(&self) -> ProviderFuture<'_, Catalog, Self::Error> {
        Box::pin(ready(Ok(lock(&self.state).catalog.clone())))
    }

    fn list_running_instances(&self) -> ProviderFuture<'_, Vec<Instance>, Self::Error> {
        let state = lock(&self.state);
        let instances = if state.launches.is_empty() || state.terminated.contains(&state.launch_id)
        {
            Vec::new()
        } else {
            vec![Self::snapshot(&state, &state.launch_id, state.get_calls)]
        };
        Box::pin(ready(Ok(instances)))
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> ProviderFuture<'a, String, Self::Error> {
        let mut state = lock(&self.state);
        state.launches.push(request.clone());
        let outcome = state
            .launch_error
            .clone()
            .map_or_else(|| Ok(state.launch_id.clone()), Err);
        Box::pin(ready(outcome))
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Instance, Self::Error> {
        let mut state = lock(&self.state);
        state.get_calls = state.get_calls.saturating_add(1);
        let call = state.get_calls;
        let outcome = state
            .get_failures
            .remove(&call)
            .map_or_else(|| Ok(Self::snapshot(&state, id, call)), Err);
        Box::pin(ready(outcome))
    }

    fn terminate<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        let mut state = lock(&self.state);
        state.terminate_calls.push(id.to_owned());
        let call = state.terminate_calls.len();
        let outcome = if let Some(error) = state.terminate_failures.remove(&call) {
            Err(error)
        } else if state.terminated.insert(id.to_owned()) {
            Ok(())
        } else {
            Err(LambdaError::Api {
                status: 404,
                body: format!(r#"{{"error":{{"code":"global/object-does-not-exist","message":"{id} not found"}}}}"#),
            })
        };
        Box::pin(ready(outcome))
    }
}

/// Session step that a [`ScriptedConnector`] can be told to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SessionStep {
    /// [`RemoteSession::upload`].
    Upload,
    /// [`RemoteSession::start`].
    Start,
    /// [`RemoteSession::collect`].
    Collect,
    /// [`RemoteSession::close`].
    Close,
}

#[derive(Debug, Default)]
struct ConnectorState {
    connect_error: Option<String>,
    failures: BTreeMap<SessionStep, String>,
    result: ExecutionResult,
    connections: Vec<IpAddr>,
    uploads: Vec<(Utf8PathBuf, Vec<u8>)>,
    commands: Vec<String>,
    close_count: usize,
    hang_collect: Option<CancellationToken>,
    interrupted: bool,
    interrupt_count: usize,
}

/// Upper bound on a hanging `collect`, so a missing interrupt fails the test
/// instead of stalling it.
const HANG_LIMIT: Duration = Duration::from_secs(10);

/// [`SessionConnector`] that records every interaction in memory.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
    wake: Arc<Condvar>,
}

impl ScriptedConnector {
    /// Creates a connector whose sessions succeed with empty output and exit
    /// status zero.
    #[must_use]
    pub fn new() -> Self {
        let connector = Self::default();
        lock(&connector.state).result.exit_status = Some(0);
        connector
    }

    /// Sets the result returned by `collect`.
    #[must_use]
    pub fn with_result(self, result: ExecutionResult) -> Self {
        lock(&self.state).result = result;
        self
    }

    /// Makes `connect` fail with `message`.
    #[must_use]
    pub fn fail_connect(self, message: &str) -> Self {
        lock(&self.state).connect_error = Some(message.to_owned());
        self
    }

    /// Makes `step` fail with `message`.
    #[must_use]
    pub fn fail_at(self, step: SessionStep, message: &str) -> Self {
        lock(&self.state).failures.insert(step, message.to_owned());
        self
    }

    /// Makes `collect` cancel `token` and then block until the session is
    /// interrupted, like a long-running workload stopped with Ctrl-C.
    #[must_use]
    pub fn hang_collect_and_cancel(self, token: &CancellationToken) -> Self {
        lock(&self.state).hang_collect = Some(token.clone());
        self
    }

    /// Number of times a session interrupt was fired.
    #[must_use]
    pub fn interrupt_count(&self) -> usize {
        lock(&self.state).interrupt_count
    }

    /// Addresses passed to `connect`.
    #[must_use]
    pub fn connections(&self) -> Vec<IpAddr> {
        lock(&self.state).connections.clone()
    }

    /// Files uploaded, as `(remote_path, contents)`.
    #[must_use]
    pub fn uploads(&self) -> Vec<(Utf8PathBuf, Vec<u8>)> {
        lock(&self.state).uploads.clone()
    }

    /// Commands started.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Number of times any session was closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }
}

impl SessionConnector for ScriptedConnector {
    type Session = ScriptedSession;

    fn connect(&self, address: IpAddr) -> Result<Self::Session, SessionError> {
        let mut state = lock(&self.state);
        state.connections.push(address);
        if let Some(message) = state.connect_error.clone() {
            return Err(SessionError::new(message));
        }
        Ok(ScriptedSession {
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
        })
    }
}

/// Session handed out by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedSession {
    state: Arc<Mutex<ConnectorState>>,
    wake: Arc<Condvar>,
}

impl ScriptedSession {
    fn check(&self, step: SessionStep) -> Result<(), SessionError> {
        lock(&self.state)
            .failures
            .get(&step)
            .map_or(Ok(()), |message| Err(SessionError::new(message.clone())))
    }
}

impl RemoteSession for ScriptedSession {
    fn upload(&mut self, remote_path: &Utf8Path, contents: &[u8]) -> Result<(), SessionError> {
        self.check(SessionStep::Upload)?;
        lock(&self.state)
            .uploads
            .push((remote_path.to_owned(), contents.to_vec()));
        Ok(())
    }

    fn start(&mut self, command: &str) -> Result<(), SessionError> {
        self.check(SessionStep::Start)?;
        lock(&self.state).commands.push(command.to_owned());
        Ok(())
    }

    fn collect(&mut self) -> Result<ExecutionResult, SessionError> {
        self.check(SessionStep::Collect)?;
        let guard = lock(&self.state);
        let Some(token) = guard.hang_collect.clone() else {
            return Ok(guard.result.clone());
        };
        token.cancel();
        let (state, _) = self
            .wake
            .wait_timeout_while(guard, HANG_LIMIT, |current| !current.interrupted)
            .unwrap_or_else(PoisonError::into_inner);
        if state.interrupted {
            Err(SessionError::new("session interrupted"))
        } else {
            Err(SessionError::new("collect was never interrupted"))
        }
    }

    fn close(&mut self) -> Result<(), SessionError> {
        {
            let mut state = lock(&self.state);
            state.close_count = state.close_count.saturating_add(1);
        }
        self.check(SessionStep::Close)
    }

    fn interrupter(&self) -> Result<SessionInterrupt, SessionError> {
        let state = Arc::clone(&self.state);
        let wake = Arc::clone(&self.wake);
        Ok(SessionInterrupt::new(move || {
            let mut current = lock(&state);
            current.interrupted = true;
            current.interrupt_count = current.interrupt_count.saturating_add(1);
            wake.notify_all();
        }))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// A `None` value removes the variable for the lifetime of the guard.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
