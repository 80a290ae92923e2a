use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A virtual machine as reported by the VPSie API.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// Provider-side identifier of the machine.
    pub id: String,

    /// Hostname the machine was created with. Matches the VPSNode name.
    pub hostname: String,

    /// Provider-side lifecycle state, e.g. `creating`, `running`,
    /// `stopped`, `deleting`.
    pub status: String,

    /// Public IPv4 address, once assigned.
    #[serde(default)]
    pub ip_address: Option<String>,

    /// Offering the machine was provisioned with.
    pub offering_id: String,

    /// Datacenter hosting the machine.
    pub datacenter_id: String,

    #[serde(default)]
    pub cpu: i32,

    #[serde(default)]
    pub memory_mb: i64,

    #[serde(default)]
    pub disk_gb: i64,
}

impl Vm {
    /// Returns true once the provider reports the machine as running.
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Request payload for creating a virtual machine.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    pub hostname: String,
    pub offering_id: String,
    pub datacenter_id: String,
    pub image_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<String>>,

    /// Tags attached to the machine so the fleet can be listed by owner.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,

    /// Free-form provider fields forwarded from the VPSNode spec.
    #[serde(flatten)]
    pub overrides: BTreeMap<String, String>,
}

/// An instance type offered by the provider.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Offering {
    pub id: String,
    pub name: String,
    pub cpu: i32,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub hourly_price: f64,

    #[serde(default)]
    pub datacenter_id: Option<String>,
}

/// A datacenter the provider can place machines in.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub region: Option<String>,
}

/// An OS image machines can be created from.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OsImage {
    pub id: String,
    pub name: String,
}

/// Response of the two-leg client-credential exchange.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: AccessToken,

    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The access-token half of a [`TokenResponse`].
#[derive(Deserialize, Clone, Debug)]
pub struct AccessToken {
    pub token: String,

    /// RFC3339 expiry of the token.
    pub expires: String,
}
