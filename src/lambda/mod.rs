//! Lambda Cloud implementation of the [`Provider`] seam.
//!
//! Every call is a single authenticated JSON request; non-2xx responses are
//! surfaced as [`LambdaError::Api`] with the raw body so callers can decide
//! what to do with them.

mod catalog;
mod error;
mod wire;

use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use tracing::debug;

use crate::config::LambdaConfig;
use crate::provider::{Catalog, Instance, LaunchRequest, Provider, ProviderFuture};
use wire::{DataEnvelope, InstanceTypesData, InstanceWire, LaunchBody, LaunchData, TerminateBody};

pub use catalog::available_instance_types;
pub use error::LambdaError;

/// Authenticated client for the Lambda Cloud control-plane API.
#[derive(Clone, Debug)]
pub struct LambdaClient {
    http: Client,
    api_base: String,
    api_key: String,
}

impl LambdaClient {
    /// Constructs a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LambdaError::Config`] when the configuration fails
    /// validation and [`LambdaError::Transport`] when the HTTP client cannot
    /// be built.
    pub fn new(config: &LambdaConfig) -> Result<Self, LambdaError> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.api_base)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, LambdaError> {
        let response = builder
            .basic_auth(&self.api_key, Some(""))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(LambdaError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let envelope: DataEnvelope<T> =
            serde_json::from_slice(&body).map_err(|err| LambdaError::Decode {
                message: err.to_string(),
            })?;
        Ok(envelope.data)
    }
}

impl Provider for LambdaClient {
    type Error = LambdaError;

    fn list_instance_types(&self) -> ProviderFuture<'_, Catalog, Self::Error> {
        Box::pin(async move {
            let data: InstanceTypesData = self
                .send(self.http.get(self.url("instance-types")))
                .await?;
            Ok(catalog::catalog_from_wire(data))
        })
    }

    fn list_running_instances(&self) -> ProviderFuture<'_, Vec<Instance>, Self::Error> {
        Box::pin(async move {
            let data: Vec<InstanceWire> = self.send(self.http.get(self.url("instances"))).await?;
            Ok(data.into_iter().map(Instance::from).collect())
        })
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            debug!(
                region = %request.region,
                instance_type = %request.instance_type,
                "requesting instance launch"
            );
            let body = LaunchBody::from(request);
            let data: LaunchData = self
                .send(
                    self.http
                        .post(self.url("instance-operations/launch"))
                        .json(&body),
                )
                .await?;
            data.instance_ids
                .into_iter()
                .next()
                .ok_or(LambdaError::EmptyLaunch)
        })
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let data: InstanceWire = self
                .send(self.http.get(self.url(&format!("instances/{id}"))))
                .await?;
            Ok(Instance::from(data))
        })
    }

    fn terminate<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let body = TerminateBody {
                instance_ids: vec![id],
            };
            self.send::<IgnoredAny>(
                self.http
                    .post(self.url("instance-operations/terminate"))
                    .json(&body),
            )
            .await?;
            Ok(())
        })
    }
}
