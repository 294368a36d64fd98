use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Sha256, Digest};
use shared::types::{AccessoriesResponse, Format, Perm, RawAccessory, RawCharacteristic, RawService};
use crate::catalog;
use crate::registry::Instance;

/// One control point within a service.
#[derive(Debug)]
pub struct Characteristic {
    pub aid: u64,
    pub iid: u64,
    /// Canonical long-form type
    pub uuid: String,
    /// Catalog name, e.g. "On"
    pub type_name: String,
    pub service_type: String,
    pub service_name: String,
    pub description: String,
    pub format: Format,
    pub perms: Vec<Perm>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_step: Option<f64>,
    value: RwLock<Value>,
}

impl Characteristic {
    /// Last known value, from a snapshot, a read or a push.
    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    /// Replace the value. Readers see either the old or the new value.
    pub fn set_value(&self, value: Value) {
        *self.value.write() = value;
    }

    pub fn can_read(&self) -> bool {
        self.perms.contains(&Perm::Read)
    }

    pub fn can_write(&self) -> bool {
        self.perms.contains(&Perm::Write)
    }

    pub fn ev(&self) -> bool {
        self.perms.contains(&Perm::Events)
    }
}

/// A group of characteristics on one accessory of one instance.
#[derive(Debug)]
pub struct Service {
    pub aid: u64,
    pub iid: u64,
    /// Canonical long-form type
    pub uuid: String,
    /// Catalog name, e.g. "Lightbulb"
    pub type_name: String,
    pub human_type: String,
    pub service_name: String,
    pub primary: bool,
    pub hidden: bool,
    pub linked: Vec<u64>,
    /// Description -> value pairs from the accessory's information service
    pub accessory_information: BTreeMap<String, Value>,
    pub instance: Arc<Instance>,
    pub unique_id: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, iid: u64) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.iid == iid)
    }

    /// Look up a characteristic by catalog name, e.g. "Brightness".
    pub fn characteristic_by_type(&self, type_name: &str) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.type_name == type_name)
    }

    /// Catalog name -> current value, recomputed from the characteristics.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.characteristics
            .iter()
            .map(|c| (c.type_name.clone(), c.value()))
            .collect()
    }

    pub fn event_characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.iter().filter(|c| c.ev())
    }
}

/// Stable external key for a service: hex SHA-256 of `username|aid|iid|type`.
pub fn unique_id(username: &str, aid: u64, iid: u64, uuid: &str) -> String {
    let hash = Sha256::digest(format!("{}|{}|{}|{}", username, aid, iid, uuid).as_bytes());
    hex::encode(hash)
}

/// Copy values from `fresh` into `current` when both graphs have the same
/// services and characteristics. Returns false, touching nothing, otherwise.
pub fn merge_values(current: &[Arc<Service>], fresh: &[Arc<Service>]) -> bool {
    let same_layout = current.len() == fresh.len()
        && current.iter().zip(fresh).all(|(a, b)| {
            a.unique_id == b.unique_id
                && a.characteristics.len() == b.characteristics.len()
                && a.characteristics.iter().zip(&b.characteristics).all(|(x, y)| x.iid == y.iid)
        });
    if !same_layout {
        return false;
    }

    for (a, b) in current.iter().zip(fresh) {
        for (x, y) in a.characteristics.iter().zip(&b.characteristics) {
            x.set_value(y.value());
        }
    }
    true
}

/// Build the normalized services of every instance's snapshot.
pub fn build_all(snapshots: &[(Arc<Instance>, AccessoriesResponse)]) -> Vec<Arc<Service>> {
    snapshots
        .iter()
        .flat_map(|(instance, snapshot)| build(instance, snapshot))
        .collect()
}

/// Build the normalized services of one instance. Unknown types are skipped.
pub fn build(instance: &Arc<Instance>, snapshot: &AccessoriesResponse) -> Vec<Arc<Service>> {
    let mut services = Vec::new();

    for accessory in &snapshot.accessories {
        let information = accessory_information(accessory);

        for raw in &accessory.services {
            let uuid = catalog::canonicalize(&raw.service_type);
            if uuid == catalog::ACCESSORY_INFORMATION {
                continue;
            }
            let Some(type_name) = catalog::service_name(&uuid) else {
                tracing::trace!("Skipping unknown service type {} on aid {}", raw.service_type, accessory.aid);
                continue;
            };

            services.push(Arc::new(build_service(instance, accessory.aid, raw, &uuid, type_name, &information)));
        }
    }

    services
}

fn build_service(
    instance: &Arc<Instance>,
    aid: u64,
    raw: &RawService,
    uuid: &str,
    type_name: &str,
    information: &BTreeMap<String, Value>,
) -> Service {
    let human_type = catalog::humanize(type_name);

    let explicit_name = raw
        .characteristics
        .iter()
        .find(|c| catalog::canonicalize(&c.characteristic_type) == catalog::NAME)
        .and_then(|c| value_to_name(&c.value));
    let service_name = explicit_name
        .or_else(|| information.get("Name").and_then(value_to_name))
        .unwrap_or_else(|| human_type.clone());

    let characteristics = raw
        .characteristics
        .iter()
        .filter_map(|c| build_characteristic(aid, c, type_name, &service_name))
        .collect();

    Service {
        aid,
        iid: raw.iid,
        uuid: uuid.to_string(),
        type_name: type_name.to_string(),
        human_type,
        service_name,
        primary: raw.primary,
        hidden: raw.hidden,
        linked: raw.linked.clone().unwrap_or_default(),
        accessory_information: information.clone(),
        instance: instance.clone(),
        unique_id: unique_id(instance.username(), aid, raw.iid, uuid),
        characteristics,
    }
}

fn build_characteristic(
    aid: u64,
    raw: &RawCharacteristic,
    service_type: &str,
    service_name: &str,
) -> Option<Characteristic> {
    let uuid = catalog::canonicalize(&raw.characteristic_type);
    if uuid == catalog::NAME {
        return None;
    }
    let type_name = catalog::characteristic_name(&uuid)?;

    Some(Characteristic {
        aid,
        iid: raw.iid,
        uuid,
        type_name: type_name.to_string(),
        service_type: service_type.to_string(),
        service_name: service_name.to_string(),
        description: raw.description.clone(),
        format: raw.format,
        perms: raw.perms.clone(),
        unit: raw.unit.clone(),
        min_value: raw.min_value,
        max_value: raw.max_value,
        min_step: raw.min_step,
        value: RwLock::new(raw.value.clone()),
    })
}

/// Collect the non-empty values of the accessory information service.
fn accessory_information(accessory: &RawAccessory) -> BTreeMap<String, Value> {
    let Some(service) = accessory
        .services
        .iter()
        .find(|s| catalog::canonicalize(&s.service_type) == catalog::ACCESSORY_INFORMATION)
    else {
        return BTreeMap::new();
    };

    service
        .characteristics
        .iter()
        .filter(|c| is_present(&c.value))
        .filter_map(|c| {
            let key = if c.description.is_empty() {
                catalog::characteristic_name(&c.characteristic_type)?.to_string()
            } else {
                c.description.clone()
            };
            Some((key, c.value.clone()))
        })
        .collect()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    }
}

fn value_to_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CharacteristicView<'a> {
    aid: u64,
    iid: u64,
    uuid: &'a str,
    #[serde(rename = "type")]
    type_name: &'a str,
    service_type: &'a str,
    service_name: &'a str,
    description: &'a str,
    value: Value,
    format: Format,
    perms: &'a [Perm],
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_step: Option<f64>,
    can_read: bool,
    can_write: bool,
    ev: bool,
}

impl Serialize for Characteristic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CharacteristicView {
            aid: self.aid,
            iid: self.iid,
            uuid: &self.uuid,
            type_name: &self.type_name,
            service_type: &self.service_type,
            service_name: &self.service_name,
            description: &self.description,
            value: self.value(),
            format: self.format,
            perms: &self.perms,
            unit: self.unit.as_deref(),
            max_value: self.max_value,
            min_value: self.min_value,
            min_step: self.min_step,
            can_read: self.can_read(),
            can_write: self.can_write(),
            ev: self.ev(),
        }
        .serialize(serializer)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceView<'a> {
    aid: u64,
    iid: u64,
    uuid: &'a str,
    #[serde(rename = "type")]
    type_name: &'a str,
    human_type: &'a str,
    service_name: &'a str,
    service_characteristics: &'a [Characteristic],
    accessory_information: &'a BTreeMap<String, Value>,
    values: BTreeMap<String, Value>,
    linked: &'a [u64],
    instance: shared::types::InstanceInfo,
    unique_id: &'a str,
}

impl Serialize for Service {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ServiceView {
            aid: self.aid,
            iid: self.iid,
            uuid: &self.uuid,
            type_name: &self.type_name,
            human_type: &self.human_type,
            service_name: &self.service_name,
            service_characteristics: &self.characteristics,
            accessory_information: &self.accessory_information,
            values: self.values(),
            linked: &self.linked,
            instance: self.instance.info(),
            unique_id: &self.unique_id,
        }
        .serialize(serializer)
    }
}
