//! Request and response payloads for the Lambda Cloud v1 API.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::provider::{Instance, InstanceStatus, LaunchRequest};

/// Every successful response wraps its payload in a `data` member.
#[derive(Debug, Deserialize)]
pub(super) struct DataEnvelope<T> {
    pub(super) data: T,
}

#[derive(Debug, Deserialize)]
pub(super) struct InstanceTypeEntry {
    pub(super) instance_type: InstanceTypeWire,
    #[serde(default)]
    pub(super) regions_with_capacity_available: Vec<RegionWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InstanceTypeWire {
    #[serde(default)]
    pub(super) description: String,
    #[serde(default)]
    pub(super) price_cents_per_hour: u32,
}

#[derive(Debug, Deserialize)]
pub(super) struct RegionWire {
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
struct InstanceTypeRef {
    name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct InstanceWire {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    region: Option<RegionWire>,
    #[serde(default)]
    instance_type: Option<InstanceTypeRef>,
}

impl From<InstanceWire> for Instance {
    fn from(value: InstanceWire) -> Self {
        Self {
            id: value.id,
            name: value.name,
            status: InstanceStatus::parse(&value.status),
            ip: value
                .ip
                .as_deref()
                .and_then(|raw| IpAddr::from_str(raw.trim()).ok()),
            region: value.region.map(|region| region.name),
            instance_type: value.instance_type.map(|kind| kind.name),
        }
    }
}

pub(super) type InstanceTypesData = BTreeMap<String, InstanceTypeEntry>;

#[derive(Debug, Serialize)]
pub(super) struct LaunchBody<'a> {
    region_name: &'a str,
    instance_type_name: &'a str,
    ssh_key_names: &'a [String],
    quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a LaunchRequest> for LaunchBody<'a> {
    fn from(request: &'a LaunchRequest) -> Self {
        Self {
            region_name: &request.region,
            instance_type_name: &request.instance_type,
            ssh_key_names: &request.ssh_key_names,
            quantity: LaunchRequest::QUANTITY,
            name: request.name.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct LaunchData {
    pub(super) instance_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct TerminateBody<'a> {
    pub(super) instance_ids: Vec<&'a str>,
}
