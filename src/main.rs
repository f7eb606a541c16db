//! Binary entry point for the `gpurun` CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, ExecCommand, LaunchArgs, PolicyArgs, RunCommand, TeardownArg};
use gpurun::{
    ExecutionResult, ExitStatusPolicy, Instance, LambdaClient, LambdaConfig, LambdaError,
    LaunchOverrides, LifecycleError, LifecycleOrchestrator, LifecycleReport, Provider,
    ReadinessPoller, RemoteConfig, RemoteExecutor, Ssh2Connector, TeardownPolicy, WaitError,
    available_instance_types,
};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("provider error: {0}")]
    Provider(#[from] LambdaError),
    #[error("{0}")]
    Wait(#[from] WaitError<LambdaError>),
    #[error("{0}")]
    Lifecycle(Box<LifecycleError<LambdaError>>),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl From<LifecycleError<LambdaError>> for CliError {
    fn from(value: LifecycleError<LambdaError>) -> Self {
        Self::Lifecycle(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpurun=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config =
        LambdaConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let client = LambdaClient::new(&config)?;

    match cli {
        Cli::Types => list_types(&client).await,
        Cli::Instances => list_instances(&client).await,
        Cli::Launch(args) => launch(&client, &config, args).await,
        Cli::Status(args) => {
            let instance = client.get_instance(&args.instance_id).await?;
            writeln!(io::stdout(), "{}", render_instance(&instance))?;
            Ok(0)
        }
        Cli::Wait(args) => {
            let instance = ReadinessPoller::from_config(&config)
                .wait_until_active_or_cancelled(&client, &args.instance_id, &cancel_on_ctrl_c())
                .await?;
            writeln!(io::stdout(), "{}", render_instance(&instance))?;
            Ok(0)
        }
        Cli::Terminate(args) => {
            client.terminate(&args.instance_id).await?;
            writeln!(io::stdout(), "{} terminating", args.instance_id)?;
            Ok(0)
        }
        Cli::Exec(command) => exec(client, &config, command).await,
        Cli::Run(command) => run(client, &config, command).await,
    }
}

async fn list_types(client: &LambdaClient) -> Result<i32, CliError> {
    let catalog = available_instance_types(&client.list_instance_types().await?);
    let mut out = io::stdout().lock();
    if catalog.is_empty() {
        writeln!(out, "no instance types have capacity available")?;
    }
    for instance_type in catalog.values() {
        writeln!(
            out,
            "{}\t{}/hr\t{}\t{}",
            instance_type.name,
            format_price(instance_type.price_cents_per_hour),
            instance_type.description,
            instance_type
                .regions
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
        )?;
    }
    Ok(0)
}

async fn list_instances(client: &LambdaClient) -> Result<i32, CliError> {
    let instances = client.list_running_instances().await?;
    let mut out = io::stdout().lock();
    for instance in &instances {
        writeln!(out, "{}", render_instance(instance))?;
    }
    Ok(0)
}

async fn launch(
    client: &LambdaClient,
    config: &LambdaConfig,
    args: LaunchArgs,
) -> Result<i32, CliError> {
    let request = config
        .launch_request(launch_overrides(args))
        .map_err(|err| CliError::Config(err.to_string()))?;
    let instance_id = client.launch(&request).await?;
    writeln!(io::stdout(), "{instance_id}")?;
    Ok(0)
}

async fn exec(
    client: LambdaClient,
    config: &LambdaConfig,
    command: ExecCommand,
) -> Result<i32, CliError> {
    let orchestrator = build_orchestrator(client, config, &command.policy)?;
    let workload = Utf8PathBuf::from(command.workload);
    let outcome = orchestrator.exec_on(&command.instance_id, &workload).await;
    finish(outcome)
}

async fn run(
    client: LambdaClient,
    config: &LambdaConfig,
    command: RunCommand,
) -> Result<i32, CliError> {
    let request = config
        .launch_request(launch_overrides(command.launch))
        .map_err(|err| CliError::Config(err.to_string()))?;
    let orchestrator = build_orchestrator(client, config, &command.policy)?;
    let workload = Utf8PathBuf::from(command.workload);
    let outcome = orchestrator.run(&request, &workload).await;
    finish(outcome)
}

fn build_orchestrator(
    client: LambdaClient,
    config: &LambdaConfig,
    policy: &PolicyArgs,
) -> Result<LifecycleOrchestrator<LambdaClient, Ssh2Connector>, CliError> {
    let remote =
        RemoteConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let executor =
        RemoteExecutor::with_ssh(&remote).map_err(|err| CliError::Config(err.to_string()))?;
    let exit_status = if policy.fail_on_nonzero {
        ExitStatusPolicy::FailOnNonZero
    } else {
        ExitStatusPolicy::Report
    };

    Ok(LifecycleOrchestrator::new(
        client,
        ReadinessPoller::from_config(config),
        executor,
        remote.remote_directory.trim(),
    )
    .with_teardown_policy(teardown_policy(policy.teardown))
    .with_exit_status_policy(exit_status)
    .with_cancellation(cancel_on_ctrl_c()))
}

fn finish(outcome: Result<LifecycleReport, LifecycleError<LambdaError>>) -> Result<i32, CliError> {
    match outcome {
        Ok(report) => {
            echo_execution(&report.execution)?;
            writeln!(
                io::stderr(),
                "instance {}: {}",
                report.instance_id,
                report.teardown
            )?;
            Ok(report.execution.exit_status.unwrap_or(0))
        }
        Err(err) => {
            if let LifecycleError::NonZeroExit { execution, .. } = &err {
                echo_execution(execution)?;
            }
            Err(err.into())
        }
    }
}

fn echo_execution(execution: &ExecutionResult) -> Result<(), CliError> {
    io::stdout().write_all(execution.stdout.as_bytes())?;
    io::stderr().write_all(execution.stderr.as_bytes())?;
    Ok(())
}

fn launch_overrides(args: LaunchArgs) -> LaunchOverrides {
    LaunchOverrides {
        region: args.region,
        instance_type: args.instance_type,
        ssh_key_names: args.ssh_keys,
        name: args.name,
    }
}

const fn teardown_policy(arg: TeardownArg) -> TeardownPolicy {
    match arg {
        TeardownArg::Leave => TeardownPolicy::LeaveRunning,
        TeardownArg::OnFailure => TeardownPolicy::TerminateOnFailure,
        TeardownArg::Always => TeardownPolicy::Always,
    }
}

/// Exit code used when a second interrupt forces the process down.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancels the returned token on the first Ctrl-C and exits on the second.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; cancelling (press Ctrl-C again to exit immediately)");
        trigger.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt received; exiting without teardown");
            process::exit(FORCED_EXIT_CODE);
        }
    });
    token
}

fn render_instance(instance: &Instance) -> String {
    let ip = instance
        .ip
        .map_or_else(|| String::from("-"), |ip| ip.to_string());
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        instance.id,
        instance.status,
        ip,
        instance.region.as_deref().unwrap_or("-"),
        instance.instance_type.as_deref().unwrap_or("-"),
        instance.name.as_deref().unwrap_or("-"),
    )
}

/// Renders integer cents as dollars without floating point.
fn format_price(cents: u32) -> String {
    let digits = format!("{cents:03}");
    let (dollars, fraction) = digits.split_at(digits.len().saturating_sub(2));
    format!("${dollars}.{fraction}")
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
