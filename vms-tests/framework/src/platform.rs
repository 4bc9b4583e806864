// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits and objects that abstract over the two generations of the compute
//! platform's VM cloning API.
//!
//! The platform itself (and authenticating to it) is somebody else's problem:
//! callers hand the harness a [`ComputeEndpoint`] that can fetch instances and
//! post instance actions. The [`CloneApi`] implementations here translate
//! clone operations into the call and response shapes each generation
//! expects.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::vmsctl::memory::MemoryTarget;

/// The generation of the compute platform the harness is talking to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// The original release, driven through a dedicated clone API tool.
    /// Instance identifiers are integers.
    Legacy,

    /// Later releases, where cloning is an extension of the standard compute
    /// API.
    Modern,
}

impl FromStr for Platform {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "modern" => Ok(Self::Modern),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unrecognized platform {}", s),
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("instance {0} not found")]
    NotFound(String),

    #[error("request rejected with code {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("failed to reach the compute API: {0}")]
    Transport(String),

    #[error("unexpected response to {action}")]
    Malformed {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The lifecycle state the platform reports for an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    #[serde(alias = "BUILD")]
    Building,
    Active,
    Blessed,
    Migrating,
    Error,
    Deleted,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::Blessed => "BLESSED",
            Self::Migrating => "MIGRATING",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Accepts identifiers encoded either as JSON strings or JSON integers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

/// What the platform reports about one instance. The harness only ever reads
/// these; the platform owns the instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,

    /// The hypervisor host currently running the instance. Changes when the
    /// instance migrates.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Addresses keyed by network name.
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<String>>,
}

impl InstanceRecord {
    /// Returns every address of this instance across all its networks.
    pub fn addrs(&self) -> Vec<&str> {
        self.addresses.values().flatten().map(String::as_str).collect()
    }
}

/// The compute platform's API, as supplied by the caller.
pub trait ComputeEndpoint {
    fn get_instance(&self, id: &str) -> Result<InstanceRecord, ApiError>;

    /// Posts `action` with `body` against instance `id` and returns the raw
    /// response body.
    fn instance_action(
        &self,
        id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, ApiError>;
}

impl<T: ComputeEndpoint + ?Sized> ComputeEndpoint for &T {
    fn get_instance(&self, id: &str) -> Result<InstanceRecord, ApiError> {
        (**self).get_instance(id)
    }

    fn instance_action(
        &self,
        id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, ApiError> {
        (**self).instance_action(id, action, body)
    }
}

/// Parameters for launching a clone of a blessed instance.
#[derive(Clone, Debug, Default)]
pub struct LaunchParams {
    /// The memory target for the new clone. The platform's default applies
    /// when absent.
    pub target: Option<MemoryTarget>,

    /// Key/value parameters handed to the guest's clone hooks.
    pub guest: BTreeMap<String, String>,
}

impl LaunchParams {
    fn target_text(&self) -> String {
        self.target.as_ref().map_or_else(|| "0".to_string(), ToString::to_string)
    }
}

/// The clone operations the harness needs from the platform.
pub trait CloneApi {
    fn pause(&self, id: &str) -> Result<(), ApiError>;
    fn unpause(&self, id: &str) -> Result<(), ApiError>;

    /// Snapshots `id` into a dormant template and returns the new template.
    fn bless(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError>;

    /// Starts a new clone of the blessed template `id`.
    fn launch(
        &self,
        id: &str,
        params: &LaunchParams,
    ) -> Result<Vec<InstanceRecord>, ApiError>;

    fn list_blessed(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError>;
    fn list_launched(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError>;

    /// Moves `id` to `dest`, or to a host of the platform's choosing.
    fn migrate(&self, id: &str, dest: Option<&str>) -> Result<(), ApiError>;

    /// Deletes the blessed template `id`.
    fn discard(&self, id: &str) -> Result<(), ApiError>;
}

fn decode<T: for<'de> Deserialize<'de>>(
    action: &str,
    value: Value,
) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|source| ApiError::Malformed {
        action: action.to_owned(),
        source,
    })
}

/// The clone API of the legacy platform. Launch parameters travel in a
/// nested `params` object and list-style responses are bare arrays.
pub struct LegacyCloneApi<E> {
    endpoint: E,
}

impl<E: ComputeEndpoint> LegacyCloneApi<E> {
    pub fn new(endpoint: E) -> Self {
        Self { endpoint }
    }

    fn records(
        &self,
        id: &str,
        action: &str,
        body: Value,
    ) -> Result<Vec<InstanceRecord>, ApiError> {
        let response = self.endpoint.instance_action(id, action, body)?;
        decode(action, response)
    }
}

impl<E: ComputeEndpoint> CloneApi for LegacyCloneApi<E> {
    fn pause(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "pause", Value::Null).map(drop)
    }

    fn unpause(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "unpause", Value::Null).map(drop)
    }

    fn bless(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_bless", json!({}))
    }

    fn launch(
        &self,
        id: &str,
        params: &LaunchParams,
    ) -> Result<Vec<InstanceRecord>, ApiError> {
        let body = json!({
            "params": {
                "target": params.target_text(),
                "guest": params.guest,
            }
        });
        self.records(id, "gc_launch", body)
    }

    fn list_blessed(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_list_blessed", json!({}))
    }

    fn list_launched(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_list_launched", json!({}))
    }

    fn migrate(&self, id: &str, dest: Option<&str>) -> Result<(), ApiError> {
        self.endpoint
            .instance_action(id, "gc_migrate", json!({ "dest": dest }))
            .map(drop)
    }

    fn discard(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "gc_discard", json!({})).map(drop)
    }
}

/// The clone API of modern platforms. Launch parameters are top-level
/// fields and list-style responses are wrapped in a `servers` object.
pub struct ModernCloneApi<E> {
    endpoint: E,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<InstanceRecord>,
}

impl<E: ComputeEndpoint> ModernCloneApi<E> {
    pub fn new(endpoint: E) -> Self {
        Self { endpoint }
    }

    fn records(
        &self,
        id: &str,
        action: &str,
        body: Value,
    ) -> Result<Vec<InstanceRecord>, ApiError> {
        let response = self.endpoint.instance_action(id, action, body)?;
        decode::<ServerList>(action, response).map(|list| list.servers)
    }
}

impl<E: ComputeEndpoint> CloneApi for ModernCloneApi<E> {
    fn pause(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "pause", json!({})).map(drop)
    }

    fn unpause(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "unpause", json!({})).map(drop)
    }

    fn bless(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_bless", json!({}))
    }

    fn launch(
        &self,
        id: &str,
        params: &LaunchParams,
    ) -> Result<Vec<InstanceRecord>, ApiError> {
        let body = json!({
            "target": params.target_text(),
            "guest_params": params.guest,
        });
        self.records(id, "gc_launch", body)
    }

    fn list_blessed(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_list_blessed", json!({}))
    }

    fn list_launched(&self, id: &str) -> Result<Vec<InstanceRecord>, ApiError> {
        self.records(id, "gc_list_launched", json!({}))
    }

    fn migrate(&self, id: &str, dest: Option<&str>) -> Result<(), ApiError> {
        self.endpoint
            .instance_action(id, "gc_migrate", json!({ "dest": dest }))
            .map(drop)
    }

    fn discard(&self, id: &str) -> Result<(), ApiError> {
        self.endpoint.instance_action(id, "gc_discard", json!({})).map(drop)
    }
}

/// Selects the clone API implementation for `platform`.
pub fn clone_api<'a, E: ComputeEndpoint + 'a>(
    platform: Platform,
    endpoint: E,
) -> Box<dyn CloneApi + 'a> {
    debug!(?platform, "selecting clone API");
    match platform {
        Platform::Legacy => Box::new(LegacyCloneApi::new(endpoint)),
        Platform::Modern => Box::new(ModernCloneApi::new(endpoint)),
    }
}
