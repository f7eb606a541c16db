//! Provider abstraction for provisioning disposable GPU instances.
//!
//! The [`Provider`] trait is the seam between the lifecycle orchestrator and a
//! cloud control plane. It is intentionally thin: every call is a single
//! request with no retry, and all business decisions (waiting, cleanup) live
//! in the callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// A purchasable class of instance together with where it can be launched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceType {
    /// Provider identifier, for example `gpu_1x_a10`.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Hourly price in integer cents.
    pub price_cents_per_hour: u32,
    /// Regions with capacity available at the time of the query.
    pub regions: BTreeSet<String>,
}

impl InstanceType {
    /// Returns `true` when at least one region reports available capacity.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.regions.is_empty()
    }
}

/// Snapshot of the provider catalogue keyed by instance type name.
pub type Catalog = BTreeMap<String, InstanceType>;

/// Lifecycle status reported by the provider for an instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum InstanceStatus {
    /// The instance is provisioning and not yet reachable.
    Booting,
    /// The instance is running and its address can be used.
    Active,
    /// The provider flagged the instance as unhealthy.
    Unhealthy,
    /// Termination has been requested and is in progress.
    Terminating,
    /// The instance has been released.
    Terminated,
    /// Any status this crate does not model explicitly.
    Other(String),
}

impl InstanceStatus {
    /// Parses a provider status string. Unknown values are preserved.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "booting" => Self::Booting,
            "active" => Self::Active,
            "unhealthy" => Self::Unhealthy,
            "terminating" => Self::Terminating,
            "terminated" => Self::Terminated,
            _ => Self::Other(value.trim().to_owned()),
        }
    }

    /// Returns the provider spelling of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Booting => "booting",
            Self::Active => "active",
            Self::Unhealthy => "unhealthy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a provisioned instance.
///
/// Instances are only ever written by the provider; callers observe them by
/// polling [`Provider::get_instance`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Opaque provider identifier.
    pub id: String,
    /// Optional human readable name given at launch.
    pub name: Option<String>,
    /// Current provider status.
    pub status: InstanceStatus,
    /// Public address; absent or unreliable until the status is active.
    pub ip: Option<IpAddr>,
    /// Region the instance was launched in.
    pub region: Option<String>,
    /// Instance type name.
    pub instance_type: Option<String>,
}

impl Instance {
    /// Returns the public address once the instance is active.
    #[must_use]
    pub fn ready_address(&self) -> Option<IpAddr> {
        if self.status == InstanceStatus::Active {
            self.ip
        } else {
            None
        }
    }
}

/// Parameters required to launch a single instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Target region (for example `us-east-1`).
    pub region: String,
    /// Instance type name (for example `gpu_1x_a10`).
    pub instance_type: String,
    /// SSH key names already registered with the provider.
    pub ssh_key_names: Vec<String>,
    /// Optional human readable instance name.
    pub name: Option<String>,
}

impl LaunchRequest {
    /// Quantity requested per launch. The lifecycle handles one instance.
    pub const QUANTITY: u32 = 1;

    /// Starts a builder for a [`LaunchRequest`].
    #[must_use]
    pub fn builder() -> LaunchRequestBuilder {
        LaunchRequestBuilder::new()
    }

    /// Validates the request, returning the first missing field.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when the region or instance type
    /// is empty, or when no non-blank SSH key name is present.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.region.trim().is_empty() {
            return Err(ProviderError::Validation("region".to_owned()));
        }
        if self.instance_type.trim().is_empty() {
            return Err(ProviderError::Validation("instance_type".to_owned()));
        }
        if self.ssh_key_names.is_empty()
            || self.ssh_key_names.iter().any(|key| key.trim().is_empty())
        {
            return Err(ProviderError::Validation("ssh_key_names".to_owned()));
        }
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(ProviderError::Validation("name".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`LaunchRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequestBuilder {
    region: String,
    instance_type: String,
    ssh_key_names: Vec<String>,
    name: Option<String>,
}

impl LaunchRequestBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Appends one SSH key name.
    #[must_use]
    pub fn ssh_key_name(mut self, value: impl Into<String>) -> Self {
        self.ssh_key_names.push(value.into());
        self
    }

    /// Appends several SSH key names.
    #[must_use]
    pub fn ssh_key_names<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_key_names.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets the optional instance name.
    #[must_use]
    pub fn name(mut self, value: Option<String>) -> Self {
        self.name = value;
        self
    }

    /// Builds and validates the [`LaunchRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is empty.
    pub fn build(self) -> Result<LaunchRequest, ProviderError> {
        let request = LaunchRequest {
            region: self.region.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            ssh_key_names: self
                .ssh_key_names
                .iter()
                .map(|key| key.trim().to_owned())
                .collect(),
            name: self.name.map(|value| value.trim().to_owned()),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Errors raised before a request reaches a provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Control-plane operations needed by the instance lifecycle.
pub trait Provider {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists every instance type with the regions that currently have capacity.
    fn list_instance_types(&self) -> ProviderFuture<'_, Catalog, Self::Error>;

    /// Lists the instances currently owned by the account.
    fn list_running_instances(&self) -> ProviderFuture<'_, Vec<Instance>, Self::Error>;

    /// Launches one instance and returns its identifier.
    ///
    /// Once this succeeds the provider is allocating billable resources.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> ProviderFuture<'a, String, Self::Error>;

    /// Fetches the current state of one instance.
    fn get_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Instance, Self::Error>;

    /// Requests termination of one instance.
    fn terminate<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;
}
