//! SSH credentials and execution settings loaded via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::host_keys::HostKeyPolicy;

/// Default remote working directory that receives the workload.
pub const DEFAULT_REMOTE_DIRECTORY: &str = "/home/ubuntu";

/// Default known-hosts store used by the trust-on-first-use policy.
pub const DEFAULT_KNOWN_HOSTS_FILE: &str = "~/.ssh/known_hosts";

/// Remote shell settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GPURUN_SSH",
    discovery(
        app_name = "gpurun",
        env_var = "GPURUN_CONFIG_PATH",
        config_file_name = "gpurun.toml",
        dotfile_name = ".gpurun.toml",
        project_file_name = "gpurun.toml"
    )
)]
pub struct RemoteConfig {
    /// Remote user to connect as.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub user: String,
    /// Private key used for public-key authentication. Supports tilde
    /// expansion. When unset the running SSH agent is used instead.
    pub private_key: Option<String>,
    /// SSH port on the instance.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Remote directory that receives the workload file.
    #[ortho_config(default = DEFAULT_REMOTE_DIRECTORY.to_owned())]
    pub remote_directory: String,
    /// Command used to invoke the workload, for example `python3 -u`.
    #[ortho_config(default = "python3".to_owned())]
    pub interpreter: String,
    /// One of `accept-new`, `strict`, `insecure`, or `fingerprint`.
    #[ortho_config(default = "accept-new".to_owned())]
    pub host_key_policy: String,
    /// Known-hosts file for the `accept-new` and `strict` policies.
    #[ortho_config(default = DEFAULT_KNOWN_HOSTS_FILE.to_owned())]
    pub known_hosts_file: String,
    /// Hex SHA-256 host key digest required by the `fingerprint` policy.
    pub host_fingerprint: Option<String>,
    /// Seconds allowed for the TCP connect, handshake, and authentication.
    #[ortho_config(default = 30)]
    pub connect_timeout_secs: u64,
}

/// Errors raised when loading or validating [`RemoteConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteConfigError {
    /// Raised when a required value is empty.
    #[error("missing {field}: set GPURUN_SSH_{env_suffix} or add {field} to gpurun.toml", env_suffix = field.to_uppercase())]
    MissingField {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a value is present but unusable.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Configuration field that failed validation.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Raised when merging configuration layers fails.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl RemoteConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, RemoteConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gpurun")])
            .map_err(|err| RemoteConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present and the host key policy resolves.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), RemoteConfigError> {
        require_value(&self.user, "user")?;
        require_value(&self.remote_directory, "remote_directory")?;
        require_value(&self.interpreter, "interpreter")?;
        if self.private_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(RemoteConfigError::MissingField {
                field: String::from("private_key"),
            });
        }
        if self.port == 0 {
            return Err(invalid("port", "must be between 1 and 65535"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs", "must be greater than zero"));
        }
        self.host_key_verification()?;
        Ok(())
    }

    /// Resolves the configured host key policy.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigError::Invalid`] for an unknown policy name and
    /// [`RemoteConfigError::MissingField`] when the policy needs a value that
    /// is not set.
    pub fn host_key_verification(&self) -> Result<HostKeyPolicy, RemoteConfigError> {
        let known_hosts = || -> Result<Utf8PathBuf, RemoteConfigError> {
            require_value(&self.known_hosts_file, "known_hosts_file")?;
            Ok(Utf8PathBuf::from(expand_tilde(self.known_hosts_file.trim())))
        };

        match self.host_key_policy.trim().to_ascii_lowercase().as_str() {
            "accept-new" => Ok(HostKeyPolicy::AcceptNew {
                known_hosts: known_hosts()?,
            }),
            "strict" => Ok(HostKeyPolicy::Strict {
                known_hosts: known_hosts()?,
            }),
            "insecure" => Ok(HostKeyPolicy::Insecure),
            "fingerprint" => self
                .host_fingerprint
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| HostKeyPolicy::Fingerprint(value.to_owned()))
                .ok_or_else(|| RemoteConfigError::MissingField {
                    field: String::from("host_fingerprint"),
                }),
            other => Err(invalid(
                "host_key_policy",
                &format!("unknown policy `{other}` (expected accept-new, strict, insecure, or fingerprint)"),
            )),
        }
    }

    /// Private key path with a leading `~/` expanded.
    #[must_use]
    pub fn private_key_path(&self) -> Option<Utf8PathBuf> {
        self.private_key
            .as_deref()
            .map(|path| Utf8PathBuf::from(expand_tilde(path.trim())))
    }

    /// Timeout applied to connection setup.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn require_value(value: &str, field: &str) -> Result<(), RemoteConfigError> {
    if value.trim().is_empty() {
        return Err(RemoteConfigError::MissingField {
            field: field.to_owned(),
        });
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> RemoteConfigError {
    RemoteConfigError::Invalid {
        field: field.to_owned(),
        message: message.to_owned(),
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
