//! Command-line interface definitions for the `gpurun` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, ValueEnum};

/// Top-level CLI for the `gpurun` binary.
#[derive(Debug, Parser)]
#[command(
    name = "gpurun",
    version,
    about = "Launch Lambda Cloud GPU instances and run workloads on them over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// List instance types that currently have capacity.
    #[command(name = "types")]
    Types,
    /// List instances owned by the account.
    #[command(name = "instances")]
    Instances,
    /// Launch one instance and print its id.
    #[command(name = "launch")]
    Launch(LaunchArgs),
    /// Show the current state of an instance.
    #[command(name = "status")]
    Status(InstanceArgs),
    /// Wait until an instance is active.
    #[command(name = "wait")]
    Wait(InstanceArgs),
    /// Run a workload on an existing instance.
    #[command(name = "exec")]
    Exec(ExecCommand),
    /// Launch an instance, wait for it, and run a workload on it.
    #[command(name = "run")]
    Run(RunCommand),
    /// Terminate an instance.
    #[command(name = "terminate")]
    Terminate(InstanceArgs),
}

/// Launch parameters; unset values fall back to configuration.
#[derive(Debug, Args)]
pub(crate) struct LaunchArgs {
    /// Region to launch in, for example `us-east-1`.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Instance type, for example `gpu_1x_a10`.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Registered SSH key name; repeat to authorise several keys.
    #[arg(long = "ssh-key", value_name = "NAME")]
    pub(crate) ssh_keys: Vec<String>,
    /// Human readable instance name.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
}

/// Identifies one instance.
#[derive(Debug, Args)]
pub(crate) struct InstanceArgs {
    /// Provider instance id.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
}

/// Policies shared by `exec` and `run`.
#[derive(Debug, Args)]
pub(crate) struct PolicyArgs {
    /// When to terminate the instance.
    #[arg(long, value_enum, default_value_t = TeardownArg::Leave)]
    pub(crate) teardown: TeardownArg,
    /// Treat a non-zero remote exit status as a failure.
    #[arg(long)]
    pub(crate) fail_on_nonzero: bool,
}

/// Arguments for `gpurun exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Provider instance id.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
    /// Local workload file to upload and run.
    #[arg(value_name = "WORKLOAD")]
    pub(crate) workload: String,
    #[command(flatten)]
    pub(crate) policy: PolicyArgs,
}

/// Arguments for `gpurun run`.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Local workload file to upload and run.
    #[arg(value_name = "WORKLOAD")]
    pub(crate) workload: String,
    #[command(flatten)]
    pub(crate) launch: LaunchArgs,
    #[command(flatten)]
    pub(crate) policy: PolicyArgs,
}

/// Teardown choices accepted on the command line.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum TeardownArg {
    /// Leave the instance running.
    #[default]
    Leave,
    /// Terminate only when waiting or execution fails.
    OnFailure,
    /// Always terminate once the workload finishes or fails.
    Always,
}
