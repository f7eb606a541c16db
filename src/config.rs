//! Provider configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::provider::LaunchRequest;

pub use crate::remote::{RemoteConfig, RemoteConfigError};

/// Default Lambda Cloud API root.
pub const DEFAULT_API_BASE: &str = "https://cloud.lambdalabs.com/api/v1";

/// Lambda Cloud configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "LAMBDA")]
pub struct LambdaConfig {
    /// API key sent as the HTTP basic-auth username. This value is required;
    /// it defaults to empty so validation can report how to provide it.
    #[ortho_config(default = String::new())]
    pub api_key: String,
    /// Root of the control-plane API.
    #[ortho_config(default = DEFAULT_API_BASE.to_owned())]
    pub api_base: String,
    /// Region used when a launch does not name one.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub default_region: String,
    /// Instance type used when a launch does not name one.
    #[ortho_config(default = "gpu_1x_a10".to_owned())]
    pub default_instance_type: String,
    /// Registered SSH key name used when a launch does not name one.
    pub default_ssh_key: Option<String>,
    /// Seconds between readiness polls.
    #[ortho_config(default = 10)]
    pub poll_interval_secs: u64,
    /// Seconds to wait for an instance to become active.
    #[ortho_config(default = 600)]
    pub wait_timeout_secs: u64,
    /// Per-request HTTP timeout in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
}

/// Per-invocation overrides applied on top of [`LambdaConfig`] defaults.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchOverrides {
    /// Region override.
    pub region: Option<String>,
    /// Instance type override.
    pub instance_type: Option<String>,
    /// SSH key names; replaces the configured default key when non-empty.
    pub ssh_key_names: Vec<String>,
    /// Instance name; a generated `gpurun-<uuid>` name is used otherwise.
    pub name: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable errors.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, key: &'static str) -> Self {
        Self {
            description,
            env_var,
            key,
        }
    }
}

impl LambdaConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {} ({}): set {}",
                metadata.description, metadata.key, metadata.env_var
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero (set {})",
                metadata.description, metadata.env_var
            )));
        }
        Ok(())
    }

    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gpurun")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable that supplies the missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::Invalid`] when a duration is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.api_key,
            &FieldMetadata::new("Lambda Cloud API key", "LAMBDA_API_KEY", "api_key"),
        )?;
        Self::require_field(
            &self.api_base,
            &FieldMetadata::new("API base URL", "LAMBDA_API_BASE", "api_base"),
        )?;
        Self::require_field(
            &self.default_region,
            &FieldMetadata::new("region", "LAMBDA_DEFAULT_REGION", "default_region"),
        )?;
        Self::require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "LAMBDA_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
            ),
        )?;
        Self::require_positive(
            self.poll_interval_secs,
            &FieldMetadata::new(
                "poll interval",
                "LAMBDA_POLL_INTERVAL_SECS",
                "poll_interval_secs",
            ),
        )?;
        Self::require_positive(
            self.wait_timeout_secs,
            &FieldMetadata::new("wait timeout", "LAMBDA_WAIT_TIMEOUT_SECS", "wait_timeout_secs"),
        )?;
        Self::require_positive(
            self.request_timeout_secs,
            &FieldMetadata::new(
                "request timeout",
                "LAMBDA_REQUEST_TIMEOUT_SECS",
                "request_timeout_secs",
            ),
        )?;
        Ok(())
    }

    /// Interval between readiness polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Upper bound on the readiness wait.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Per-request HTTP timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Builds a [`LaunchRequest`] from the configured defaults and overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no SSH key name is
    /// available and [`ConfigError::Parse`] when the request fails
    /// validation.
    pub fn launch_request(&self, overrides: LaunchOverrides) -> Result<LaunchRequest, ConfigError> {
        let ssh_key_names = if overrides.ssh_key_names.is_empty() {
            let Some(key) = self.default_ssh_key.clone() else {
                return Err(ConfigError::MissingField(String::from(
                    "missing SSH key name: set LAMBDA_DEFAULT_SSH_KEY or pass --ssh-key",
                )));
            };
            vec![key]
        } else {
            overrides.ssh_key_names
        };

        let name = overrides
            .name
            .unwrap_or_else(|| format!("gpurun-{}", Uuid::new_v4().simple()));

        LaunchRequest::builder()
            .region(overrides.region.unwrap_or_else(|| self.default_region.clone()))
            .instance_type(
                overrides
                    .instance_type
                    .unwrap_or_else(|| self.default_instance_type.clone()),
            )
            .ssh_key_names(ssh_key_names)
            .name(Some(name))
            .build()
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn valid_config() -> LambdaConfig {
        LambdaConfig {
            api_key: String::from("secret"),
            api_base: String::from(DEFAULT_API_BASE),
            default_region: String::from("us-east-1"),
            default_instance_type: String::from("gpu_1x_a10"),
            default_ssh_key: Some(String::from("pc")),
            poll_interval_secs: 10,
            wait_timeout_secs: 600,
            request_timeout_secs: 30,
        }
    }

    #[rstest]
    fn missing_api_key_names_the_environment_variable(valid_config: LambdaConfig) {
        let cfg = LambdaConfig {
            api_key: String::from("   "),
            ..valid_config
        };
        let error = cfg.validate().expect_err("api key is required");
        let ConfigError::MissingField(ref message) = error else {
            panic!("expected MissingField, got {error:?}");
        };
        assert!(message.contains("LAMBDA_API_KEY"), "message: {message}");
        assert!(message.contains("api_key"), "message: {message}");
    }

    #[rstest]
    fn zero_poll_interval_is_rejected(valid_config: LambdaConfig) {
        let cfg = LambdaConfig {
            poll_interval_secs: 0,
            ..valid_config
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    fn durations_follow_configured_seconds(valid_config: LambdaConfig) {
        assert_eq!(valid_config.poll_interval(), Duration::from_secs(10));
        assert_eq!(valid_config.wait_timeout(), Duration::from_secs(600));
        assert_eq!(valid_config.request_timeout(), Duration::from_secs(30));
    }

    #[rstest]
    fn launch_request_uses_defaults_and_generates_name(valid_config: LambdaConfig) {
        let request = valid_config
            .launch_request(LaunchOverrides::default())
            .expect("defaults should build");
        assert_eq!(request.region, "us-east-1");
        assert_eq!(request.instance_type, "gpu_1x_a10");
        assert_eq!(request.ssh_key_names, vec![String::from("pc")]);
        assert!(
            request
                .name
                .as_deref()
                .is_some_and(|name| name.starts_with("gpurun-")),
            "unexpected name: {:?}",
            request.name
        );
    }

    #[rstest]
    fn launch_request_prefers_overrides(valid_config: LambdaConfig) {
        let request = valid_config
            .launch_request(LaunchOverrides {
                region: Some(String::from("us-west-2")),
                instance_type: Some(String::from("gpu_8x_h100")),
                ssh_key_names: vec![String::from("laptop"), String::from("ci")],
                name: Some(String::from("training")),
            })
            .expect("overrides should build");
        assert_eq!(request.region, "us-west-2");
        assert_eq!(request.instance_type, "gpu_8x_h100");
        assert_eq!(request.ssh_key_names.len(), 2);
        assert_eq!(request.name.as_deref(), Some("training"));
    }

    #[rstest]
    fn launch_request_requires_a_key(valid_config: LambdaConfig) {
        let cfg = LambdaConfig {
            default_ssh_key: None,
            ..valid_config
        };
        let error = cfg
            .launch_request(LaunchOverrides::default())
            .expect_err("a key name is required");
        assert!(error.to_string().contains("LAMBDA_DEFAULT_SSH_KEY"));
    }
}
