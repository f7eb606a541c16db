//! Core library for the `gpurun` GPU workload runner.
//!
//! The crate exposes a [`Provider`] abstraction over a cloud control plane, a
//! Lambda Cloud implementation of it, and the pieces that drive one workload
//! through an instance lifecycle (launch → wait until active → run over SSH →
//! optional teardown).

pub mod config;
pub mod lambda;
pub mod orchestrator;
pub mod provider;
pub mod readiness;
pub mod remote;
pub mod test_support;

pub use config::{ConfigError, LambdaConfig, LaunchOverrides};
pub use lambda::{LambdaClient, LambdaError, available_instance_types};
pub use orchestrator::{
    ExitStatusPolicy, LifecycleError, LifecycleOrchestrator, LifecycleReport, LifecycleState,
    TeardownOutcome, TeardownPolicy,
};
pub use provider::{
    Catalog, Instance, InstanceStatus, InstanceType, LaunchRequest, LaunchRequestBuilder,
    Provider, ProviderError, ProviderFuture,
};
pub use readiness::{ReadinessPoller, WaitError};
pub use remote::{
    DEFAULT_REMOTE_DIRECTORY, ExecuteError, ExecutionPhase, ExecutionResult, HostKeyPolicy,
    RemoteConfig, RemoteConfigError, RemoteExecutionError, RemoteExecutor, RemoteSession,
    SessionConnector, SessionError, SessionInterrupt, Ssh2Connector, Ssh2Session,
};
