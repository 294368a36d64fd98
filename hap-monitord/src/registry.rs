use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use shared::types::InstanceInfo;

/// Consecutive polling failures tolerated before an instance is evicted.
pub const MAX_CONNECTION_FAILURES: u32 = 5;

/// A validated accessory server as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub username: String,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct Address {
    name: String,
    ip_address: String,
    port: u16,
    last_seen: DateTime<Utc>,
}

/// One accessory server. Identity is `username`; the address is updated in
/// place on rediscovery so services holding an `Arc<Instance>` stay valid.
#[derive(Debug)]
pub struct Instance {
    username: String,
    address: RwLock<Address>,
    connection_failed_count: AtomicU32,
    first_seen: DateTime<Utc>,
}

impl Instance {
    pub fn new(record: InstanceRecord) -> Self {
        let now = Utc::now();
        Self {
            username: record.username,
            address: RwLock::new(Address {
                name: record.name,
                ip_address: record.ip_address,
                port: record.port,
                last_seen: now,
            }),
            connection_failed_count: AtomicU32::new(0),
            first_seen: now,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn name(&self) -> String {
        self.address.read().name.clone()
    }

    pub fn ip_address(&self) -> String {
        self.address.read().ip_address.clone()
    }

    pub fn port(&self) -> u16 {
        self.address.read().port
    }

    /// `http://ip:port`, read under one lock so address and port agree.
    pub fn base_url(&self) -> String {
        let address = self.address.read();
        format!("http://{}:{}", address.ip_address, address.port)
    }

    /// `ip:port` for raw socket connections.
    pub fn socket_addr(&self) -> String {
        let address = self.address.read();
        format!("{}:{}", address.ip_address, address.port)
    }

    pub fn connection_failed_count(&self) -> u32 {
        self.connection_failed_count.load(Ordering::SeqCst)
    }

    /// `name (username)`, the form used in log lines and user-facing errors.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name(), self.username)
    }

    pub fn info(&self) -> InstanceInfo {
        let address = self.address.read();
        InstanceInfo {
            username: self.username.clone(),
            name: address.name.clone(),
            ip_address: address.ip_address.clone(),
            port: address.port,
            connection_failed_count: self.connection_failed_count(),
            first_seen: self.first_seen,
            last_seen: address.last_seen,
        }
    }

    /// Apply a rediscovery. Returns true if anything but the timestamp changed.
    fn update(&self, record: &InstanceRecord) -> bool {
        let mut address = self.address.write();
        address.last_seen = Utc::now();

        let changed = address.name != record.name
            || address.ip_address != record.ip_address
            || address.port != record.port;
        if changed {
            address.name = record.name.clone();
            address.ip_address = record.ip_address.clone();
            address.port = record.port;
        }
        changed
    }

    fn touch(&self) {
        self.address.write().last_seen = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Ignored,
}

/// Published to observers whenever an instance is new or materially changed.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    InstanceDiscovered(Arc<Instance>),
    InstanceEvicted(String),
}

/// Owns every known instance, keyed by username.
pub struct Registry {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    blacklist: Vec<String>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new(blacklist: &[String]) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            instances: RwLock::new(HashMap::new()),
            blacklist: blacklist.iter().map(|u| u.to_lowercase()).collect(),
            events,
        }
    }

    /// Register an observer for `instance-discovered` and eviction events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn is_blacklisted(&self, username: &str) -> bool {
        let username = username.to_lowercase();
        self.blacklist.iter().any(|b| *b == username)
    }

    pub fn get(&self, username: &str) -> Option<Arc<Instance>> {
        self.instances.read().get(username).cloned()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.instances.read().contains_key(username)
    }

    /// Insert or update an instance. Only actual changes are published.
    pub fn upsert(&self, record: InstanceRecord) -> UpsertOutcome {
        if self.is_blacklisted(&record.username) {
            tracing::debug!("Ignoring blacklisted instance {}", record.username);
            return UpsertOutcome::Ignored;
        }

        let (outcome, instance) = {
            let mut instances = self.instances.write();
            match instances.get(&record.username) {
                Some(existing) => {
                    if existing.update(&record) {
                        (UpsertOutcome::Updated, existing.clone())
                    } else {
                        return UpsertOutcome::Ignored;
                    }
                }
                None => {
                    let instance = Arc::new(Instance::new(record));
                    instances.insert(instance.username.clone(), instance.clone());
                    (UpsertOutcome::Created, instance)
                }
            }
        };

        match outcome {
            UpsertOutcome::Created => tracing::info!(
                "Discovered instance {} at {}",
                instance.label(),
                instance.socket_addr()
            ),
            _ => tracing::info!(
                "Instance {} changed, now at {}",
                instance.label(),
                instance.socket_addr()
            ),
        }
        let _ = self.events.send(RegistryEvent::InstanceDiscovered(instance));
        outcome
    }

    /// Count a polling failure. Returns true if the instance was evicted.
    pub fn record_failure(&self, username: &str) -> bool {
        let mut instances = self.instances.write();
        let Some(instance) = instances.get(username) else {
            return false;
        };

        let count = instance.connection_failed_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= MAX_CONNECTION_FAILURES {
            return false;
        }

        if let Some(instance) = instances.remove(username) {
            tracing::info!(
                "Evicting instance {} after {} consecutive failures",
                instance.label(),
                count
            );
        }
        drop(instances);
        let _ = self.events.send(RegistryEvent::InstanceEvicted(username.to_string()));
        true
    }

    pub fn record_success(&self, username: &str) {
        if let Some(instance) = self.get(username) {
            instance.connection_failed_count.store(0, Ordering::SeqCst);
            instance.touch();
        }
    }

    pub fn remove(&self, username: &str) -> Option<Arc<Instance>> {
        self.instances.write().remove(username)
    }

    pub fn clear(&self) {
        self.instances.write().clear();
    }

    /// Point-in-time snapshot, sorted by username.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<Arc<Instance>> = self.instances.read().values().cloned().collect();
        instances.sort_by(|a, b| a.username.cmp(&b.username));
        instances
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}
