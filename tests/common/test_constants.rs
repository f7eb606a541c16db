//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Region used by `gpurun` when no override is provided.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Lambda Cloud instance type used by `gpurun` when no override is provided.
pub const DEFAULT_INSTANCE_TYPE: &str = "gpu_1x_a10";
