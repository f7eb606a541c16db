//! BDD step definitions for the instance lifecycle.

use std::net::IpAddr;

use gpurun::test_support::{ScriptedConnector, ScriptedProvider};
use gpurun::{ExecutionResult, LaunchRequest, TeardownOutcome};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{LifecycleContext, paused_runtime};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given(
    "a provider that launches \"{instance_id}\" and reports it active at \"{ip}\" after \"{polls}\" booting polls"
)]
fn provider_becomes_active(
    lifecycle_context: &LifecycleContext,
    instance_id: String,
    ip: String,
    polls: usize,
) -> Result<(), StepError> {
    let address: IpAddr = ip
        .parse()
        .map_err(|err| StepError::Assertion(format!("invalid address {ip}: {err}")))?;
    *lifecycle_context.provider.borrow_mut() = ScriptedProvider::new()
        .with_launch_id(&instance_id)
        .active_after(polls)
        .with_ip(address);
    Ok(())
}

#[given("a provider that launches \"{instance_id}\" and never reports it active")]
fn provider_never_active(lifecycle_context: &LifecycleContext, instance_id: String) {
    *lifecycle_context.provider.borrow_mut() = ScriptedProvider::new()
        .with_launch_id(&instance_id)
        .never_active();
}

#[given("a remote shell that prints the training summary")]
fn remote_shell_prints_summary(lifecycle_context: &LifecycleContext) {
    *lifecycle_context.connector.borrow_mut() = ScriptedConnector::new().with_result(ExecutionResult {
        stdout: String::from(
            "Starting training...\nTraining progress: 100%\nTraining complete!\nFinal loss: 0.1000\n",
        ),
        stderr: String::new(),
        exit_status: Some(0),
    });
}

#[when(
    "I run the workload \"{workload}\" in \"{region}\" on \"{instance_type}\" with key \"{key}\""
)]
fn run_workload(
    lifecycle_context: &LifecycleContext,
    workload: String,
    region: String,
    instance_type: String,
    key: String,
) -> Result<(), StepError> {
    let request = LaunchRequest::builder()
        .region(region)
        .instance_type(instance_type)
        .ssh_key_name(key)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let path = lifecycle_context.stage_workload(&workload);
    let orchestrator = lifecycle_context.orchestrator();

    let outcome = paused_runtime().block_on(orchestrator.run(&request, &path));
    *lifecycle_context.outcome.borrow_mut() = Some(outcome);
    Ok(())
}

#[when("I terminate \"{instance_id}\" twice")]
fn terminate_twice(lifecycle_context: &LifecycleContext, instance_id: String) {
    let orchestrator = lifecycle_context.orchestrator();
    let outcomes = paused_runtime().block_on(async {
        let first = orchestrator.terminate(&instance_id).await;
        let second = orchestrator.terminate(&instance_id).await;
        vec![first, second]
    });
    *lifecycle_context.terminations.borrow_mut() = outcomes;
}

#[then("the lifecycle succeeds on instance \"{instance_id}\"")]
fn lifecycle_succeeds(
    lifecycle_context: &LifecycleContext,
    instance_id: String,
) -> Result<(), StepError> {
    match lifecycle_context.outcome.borrow().as_ref() {
        Some(Ok(report)) if report.instance_id == instance_id => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected success on {instance_id}, got {other:?}"
        ))),
    }
}

#[then("the lifecycle fails with \"{expected}\"")]
fn lifecycle_fails(lifecycle_context: &LifecycleContext, expected: String) -> Result<(), StepError> {
    match lifecycle_context.outcome.borrow().as_ref() {
        Some(Err(err)) if err.to_string().contains(&expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure mentioning '{expected}', got {other:?}"
        ))),
    }
}

#[then("the workload was uploaded to \"{remote_path}\"")]
fn workload_uploaded(
    lifecycle_context: &LifecycleContext,
    remote_path: String,
) -> Result<(), StepError> {
    let uploads = lifecycle_context.connector.borrow().uploads();
    match uploads.as_slice() {
        [(path, contents)] if path.as_str() == remote_path && !contents.is_empty() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one upload to {remote_path}, got {} uploads",
            other.len()
        ))),
    }
}

#[then("the uploaded workload reports a final loss of \"{loss}\"")]
fn uploaded_workload_reports_loss(
    lifecycle_context: &LifecycleContext,
    loss: String,
) -> Result<(), StepError> {
    let uploads = lifecycle_context.connector.borrow().uploads();
    let Some((_, contents)) = uploads.first() else {
        return Err(StepError::Assertion(String::from("nothing was uploaded")));
    };
    let script = String::from_utf8_lossy(contents);
    let expected_return = format!("return {}", loss.trim_end_matches('0'));
    if script.contains(&expected_return) && script.contains("Final loss: {final_loss:.4f}") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "uploaded workload does not report a final loss of {loss}:\n{script}"
        )))
    }
}

#[then("the output contains \"{text}\"")]
fn output_contains(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    match lifecycle_context.outcome.borrow().as_ref() {
        Some(Ok(report)) if report.execution.stdout.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected stdout containing '{text}', got {other:?}"
        ))),
    }
}

#[then("the remote shell was never opened")]
fn remote_shell_unused(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let connections = lifecycle_context.connector.borrow().connections();
    if connections.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no connections, got {connections:?}"
        )))
    }
}

#[then("the instance is left running")]
fn instance_left_running(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let terminated = lifecycle_context.provider.borrow().terminate_calls();
    if terminated.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no termination, got {terminated:?}"
        )))
    }
}

#[then("the first termination succeeds")]
fn first_termination_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match lifecycle_context.terminations.borrow().first() {
        Some(TeardownOutcome::Terminated) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the first termination to succeed, got {other:?}"
        ))),
    }
}

#[then("the second termination reports \"{expected}\"")]
fn second_termination_reports(
    lifecycle_context: &LifecycleContext,
    expected: String,
) -> Result<(), StepError> {
    match lifecycle_context.terminations.borrow().get(1) {
        Some(TeardownOutcome::Failed(message)) if message.contains(&expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the second termination to report '{expected}', got {other:?}"
        ))),
    }
}
