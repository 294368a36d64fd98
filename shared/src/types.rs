use serde::{Serialize, Deserialize};
use serde_json::Value;

/// Body of `GET /accessories`: the full snapshot of one accessory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoriesResponse {
    pub accessories: Vec<RawAccessory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAccessory {
    pub aid: u64,
    #[serde(default)]
    pub services: Vec<RawService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawService {
    pub iid: u64,

    /// Service type, either a short form such as "43" or a full UUID
    #[serde(rename = "type")]
    pub service_type: String,

    #[serde(default)]
    pub primary: bool,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Vec<u64>>,

    #[serde(default)]
    pub characteristics: Vec<RawCharacteristic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCharacteristic {
    pub iid: u64,

    #[serde(rename = "type")]
    pub characteristic_type: String,

    #[serde(default)]
    pub description: String,

    /// Absent for write-only characteristics
    #[serde(default)]
    pub value: Value,

    pub format: Format,

    #[serde(default)]
    pub perms: Vec<Perm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_step: Option<f64>,
}

/// Characteristic value format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bool,
    Int,
    Float,
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Data,
    Tlv8,
    Array,
    Dictionary,
    #[serde(other)]
    Unknown,
}

/// Characteristic permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perm {
    /// Paired read
    #[serde(rename = "pr")]
    Read,
    /// Paired write
    #[serde(rename = "pw")]
    Write,
    /// Event notifications
    #[serde(rename = "ev")]
    Events,
    /// Additional authorization
    #[serde(rename = "aa")]
    AdditionalAuthorization,
    /// Timed write
    #[serde(rename = "tw")]
    TimedWrite,
    /// Hidden
    #[serde(rename = "hd")]
    Hidden,
    #[serde(other)]
    Unknown,
}

/// One entry of a `/characteristics` read response or push body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicValue {
    pub aid: i64,
    pub iid: i64,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

/// Body of `GET /characteristics` responses and of `EVENT` pushes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacteristicsResponse {
    #[serde(default)]
    pub characteristics: Vec<CharacteristicValue>,
}

/// One entry of a `PUT /characteristics` body: a value write or an event subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicWrite {
    pub aid: i64,
    pub iid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ev: Option<bool>,
}

impl CharacteristicWrite {
    pub fn value(aid: i64, iid: i64, value: Value) -> Self {
        Self { aid, iid, value: Some(value), ev: None }
    }

    pub fn subscribe(aid: i64, iid: i64) -> Self {
        Self { aid, iid, value: None, ev: Some(true) }
    }
}

/// Body of `PUT /characteristics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacteristicsWriteRequest {
    pub characteristics: Vec<CharacteristicWrite>,
}

/// Point-in-time view of a registered accessory server.
/// This is what the registry hands to the API and to log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Stable device identifier from the `id` TXT record
    pub username: String,

    /// Display name from the `md` TXT record
    pub name: String,

    pub ip_address: String,

    pub port: u16,

    /// Consecutive polling failures
    pub connection_failed_count: u32,

    /// First time this instance was validated
    pub first_seen: chrono::DateTime<chrono::Utc>,

    /// Last successful discovery or poll
    pub last_seen: chrono::DateTime<chrono::Utc>,
}
