//! BDD scenarios for the instance lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Run a training script on a freshly launched instance"
)]
fn scenario_run_training_script(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Give up on an instance that never becomes active"
)]
fn scenario_readiness_timeout(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Terminating an instance twice is not fatal"
)]
fn scenario_double_terminate(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
