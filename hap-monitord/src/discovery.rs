use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use shared::protocol::PROBE_ID;
use shared::types::{CharacteristicWrite, CharacteristicsWriteRequest};
use crate::client::AccessoryClient;
use crate::config::DiscoveryConfig;
use crate::error::HapError;
use crate::registry::{Instance, InstanceRecord, Registry, UpsertOutcome};

/// One advertisement seen by the discovery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Stable device identifier
    pub username: String,
    pub name: String,
    pub port: u16,
    /// Every advertised address, in any family
    pub addresses: Vec<String>,
}

/// Source of candidate advertisements.
pub trait DiscoveryTransport: Send + Sync {
    /// Start browsing. Candidates arrive on the returned channel until
    /// `stop_browse` is called. Calling `browse` again re-announces.
    fn browse(&self) -> Result<mpsc::Receiver<Candidate>>;

    fn stop_browse(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Browsing,
}

/// Checks a candidate is a reachable accessory server that accepts our pin.
#[derive(Clone)]
pub struct Validator {
    registry: Arc<Registry>,
    client: Arc<dyn AccessoryClient>,
    pin: Arc<str>,
    probe_timeout: Duration,
}

impl Validator {
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn AccessoryClient>,
        pin: &str,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            pin: Arc::from(pin),
            probe_timeout,
        }
    }

    /// Validate and register a candidate. Returns `None` when it was dropped.
    pub async fn handle_candidate(&self, candidate: Candidate) -> Option<UpsertOutcome> {
        if self.registry.is_blacklisted(&candidate.username) {
            tracing::debug!("Skipping blacklisted instance {}", candidate.username);
            return None;
        }

        // Known instances keep their validated address
        if let Some(existing) = self.registry.get(&candidate.username) {
            return Some(self.registry.upsert(InstanceRecord {
                username: candidate.username,
                name: candidate.name,
                ip_address: existing.ip_address(),
                port: candidate.port,
            }));
        }

        let Some(probe) = self.probe_addresses(&candidate).await else {
            tracing::debug!(
                "No reachable address for {} ({}) in {:?}",
                candidate.name,
                candidate.username,
                candidate.addresses
            );
            return None;
        };

        if let Err(e) = self.check_credentials(&probe).await {
            match &e {
                HapError::Unauthorized { .. } => tracing::warn!("{}", e),
                _ => tracing::debug!("Credential check failed for {}: {}", probe.label(), e),
            }
            return None;
        }

        Some(self.registry.upsert(InstanceRecord {
            username: candidate.username,
            name: candidate.name,
            ip_address: probe.ip_address(),
            port: probe.port(),
        }))
    }

    /// Try each IPv4 address in turn; the first one serving a snapshot wins.
    async fn probe_addresses(&self, candidate: &Candidate) -> Option<Instance> {
        let addresses = candidate
            .addresses
            .iter()
            .filter_map(|address| address.parse::<Ipv4Addr>().ok());

        for address in addresses {
            let probe = Instance::new(InstanceRecord {
                username: candidate.username.clone(),
                name: candidate.name.clone(),
                ip_address: address.to_string(),
                port: candidate.port,
            });

            match tokio::time::timeout(
                self.probe_timeout,
                self.client.get_accessories(&probe, self.probe_timeout),
            )
            .await
            {
                Ok(Ok(_)) => return Some(probe),
                Ok(Err(e)) if e.is_unreachable() => {
                    tracing::debug!("Probe of {} failed: {}", probe.socket_addr(), e)
                }
                Ok(Err(e)) => tracing::debug!("{} is not an accessory server: {}", probe.socket_addr(), e),
                Err(_) => tracing::debug!("Probe of {} timed out", probe.socket_addr()),
            }
        }
        None
    }

    /// Write to the reserved `-1.-1` id. Only an authorization failure or an
    /// unreachable server counts against the candidate; a rejection of the
    /// bogus ids proves the pin was accepted.
    async fn check_credentials(&self, probe: &Instance) -> crate::error::Result<()> {
        let request = CharacteristicsWriteRequest {
            characteristics: vec![CharacteristicWrite {
                aid: PROBE_ID,
                iid: PROBE_ID,
                value: None,
                ev: None,
            }],
        };

        let result = match tokio::time::timeout(
            self.probe_timeout,
            self.client.put_characteristics(probe, &request, &self.pin, self.probe_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HapError::Timeout { url: probe.base_url() }),
        };

        match result {
            Ok(()) | Err(HapError::Status { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

enum DiscoveryCommand {
    Refresh,
    Reset,
}

/// Handle to drive the discovery task
#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::Sender<DiscoveryCommand>,
    state: watch::Receiver<DiscoveryState>,
}

impl DiscoveryHandle {
    /// Start (or restart) a browsing window now.
    pub async fn refresh(&self) -> Result<()> {
        self.tx.send(DiscoveryCommand::Refresh).await?;
        Ok(())
    }

    /// Stop browsing, forget every instance and browse again after the reset delay.
    pub async fn reset_instance_pool(&self) -> Result<()> {
        self.tx.send(DiscoveryCommand::Reset).await?;
        Ok(())
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.clone()
    }
}

/// Spawn the discovery task. It browses immediately.
pub fn spawn(
    transport: Arc<dyn DiscoveryTransport>,
    validator: Validator,
    config: DiscoveryConfig,
    cancel: CancellationToken,
) -> (DiscoveryHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(DiscoveryState::Idle);

    let handle = tokio::spawn(async move {
        Discovery {
            transport,
            validator,
            config,
            state: state_tx,
            candidates: None,
            validations: JoinSet::new(),
        }
        .run(rx, cancel)
        .await
    });

    (DiscoveryHandle { tx, state: state_rx }, handle)
}

struct Discovery {
    transport: Arc<dyn DiscoveryTransport>,
    validator: Validator,
    config: DiscoveryConfig,
    state: watch::Sender<DiscoveryState>,
    candidates: Option<mpsc::Receiver<Candidate>>,
    validations: JoinSet<()>,
}

async fn next_candidate(candidates: &mut Option<mpsc::Receiver<Candidate>>) -> Option<Candidate> {
    match candidates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Discovery {
    async fn run(mut self, mut commands: mpsc::Receiver<DiscoveryCommand>, cancel: CancellationToken) {
        tracing::info!("Starting HAP discovery");

        let mut window_end = self.start_browsing();
        let mut rearm_at: Option<Instant> = None;

        loop {
            tokio::select! {
                candidate = next_candidate(&mut self.candidates) => {
                    match candidate {
                        Some(candidate) => {
                            let validator = self.validator.clone();
                            self.validations.spawn(async move {
                                validator.handle_candidate(candidate).await;
                            });
                        }
                        None => {
                            tracing::debug!("Discovery transport closed its candidate stream");
                            self.stop_browsing();
                            window_end = None;
                        }
                    }
                }

                Some(_) = self.validations.join_next(), if !self.validations.is_empty() => {}

                _ = deadline(window_end) => {
                    tracing::debug!("Browse window elapsed");
                    self.stop_browsing();
                    window_end = None;
                }

                _ = deadline(rearm_at) => {
                    rearm_at = None;
                    window_end = self.start_browsing();
                }

                command = commands.recv() => {
                    match command {
                        Some(DiscoveryCommand::Refresh) => {
                            rearm_at = None;
                            window_end = self.start_browsing();
                        }
                        Some(DiscoveryCommand::Reset) => {
                            tracing::info!("Resetting instance pool");
                            self.validations.abort_all();
                            self.validator.registry.clear();
                            self.stop_browsing();
                            window_end = None;
                            rearm_at = Some(Instant::now() + self.config.reset_delay());
                        }
                        None => break,
                    }
                }

                _ = cancel.cancelled() => {
                    tracing::info!("HAP discovery shutting down");
                    break;
                }
            }
        }

        self.stop_browsing();
        self.validations.shutdown().await;
    }

    /// Returns the end of the new browse window, or `None` if browsing failed.
    fn start_browsing(&mut self) -> Option<Instant> {
        if self.candidates.is_some() {
            self.stop_browsing();
        }

        match self.transport.browse() {
            Ok(rx) => {
                self.candidates = Some(rx);
                self.state.send_replace(DiscoveryState::Browsing);
                Some(Instant::now() + self.config.browse_window())
            }
            Err(e) => {
                tracing::error!("Failed to start browsing: {:#}", e);
                self.state.send_replace(DiscoveryState::Idle);
                None
            }
        }
    }

    fn stop_browsing(&mut self) {
        if self.candidates.take().is_some() {
            if let Err(e) = self.transport.stop_browse() {
                tracing::warn!("Failed to stop browsing: {:#}", e);
            }
        }
        self.state.send_replace(DiscoveryState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use crate::client::fake::{FakeClient, PutOutcome};
    use crate::registry::RegistryEvent;

    fn snapshot() -> serde_json::Value {
        json!({"accessories": [{"aid": 1, "services": []}]})
    }

    fn candidate(username: &str, addresses: &[&str]) -> Candidate {
        Candidate {
            username: username.to_string(),
            name: "Homebridge".to_string(),
            port: 51826,
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn validator(client: FakeClient, blacklist: &[String]) -> (Arc<Registry>, Arc<FakeClient>, Validator) {
        let registry = Arc::new(Registry::new(blacklist));
        let client = Arc::new(client);
        let validator = Validator::new(registry.clone(), client.clone(), "031-45-154", Duration::from_secs(1));
        (registry, client, validator)
    }

    #[tokio::test]
    async fn test_first_reachable_address_wins() {
        let client = FakeClient::default()
            .with_snapshot("10.0.0.2", snapshot())
            .with_snapshot("10.0.0.3", snapshot());
        let (registry, client, validator) = validator(client, &[]);

        let outcome = validator
            .handle_candidate(candidate("A", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
            .await;

        assert_eq!(outcome, Some(UpsertOutcome::Created));
        assert_eq!(registry.get("A").unwrap().ip_address(), "10.0.0.2");
        assert_eq!(
            client.calls(),
            vec![
                "GET 10.0.0.1/accessories".to_string(),
                "GET 10.0.0.2/accessories".to_string(),
                "PUT 10.0.0.2/characteristics".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_only_ipv4_literals_are_probed() {
        let client = FakeClient::default().with_snapshot("10.0.0.2", snapshot());
        let (registry, client, validator) = validator(client, &[]);

        validator
            .handle_candidate(candidate("A", &["fe80::1", "bridge.local", "10.0.0.2"]))
            .await;

        assert!(registry.contains("A"));
        assert_eq!(client.calls()[0], "GET 10.0.0.2/accessories");
    }

    #[tokio::test]
    async fn test_invalid_snapshot_is_dropped() {
        let client = FakeClient::default().with_snapshot("10.0.0.1", json!({"services": []}));
        let (registry, _, validator) = validator(client, &[]);

        assert_eq!(validator.handle_candidate(candidate("A", &["10.0.0.1"])).await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_probe_ids_still_validate() {
        let client = FakeClient::default()
            .with_snapshot("10.0.0.1", snapshot())
            .with_put("10.0.0.1", PutOutcome::Reject);
        let (registry, _, validator) = validator(client, &[]);

        validator.handle_candidate(candidate("A", &["10.0.0.1"])).await;
        assert!(registry.contains("A"));
    }

    #[tokio::test]
    async fn test_wrong_pin_is_dropped() {
        let client = FakeClient::default()
            .with_snapshot("10.0.0.1", snapshot())
            .with_put("10.0.0.1", PutOutcome::Unauthorized);
        let (registry, _, validator) = validator(client, &[]);

        assert_eq!(validator.handle_candidate(candidate("A", &["10.0.0.1"])).await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_known_instance_skips_probing() {
        let client = FakeClient::default().with_snapshot("10.0.0.1", snapshot());
        let (registry, client, validator) = validator(client, &[]);
        validator.handle_candidate(candidate("A", &["10.0.0.1"])).await;
        let calls = client.calls().len();

        assert_eq!(
            validator.handle_candidate(candidate("A", &["10.0.0.9"])).await,
            Some(UpsertOutcome::Ignored)
        );

        let mut moved = candidate("A", &["10.0.0.9"]);
        moved.port = 51900;
        assert_eq!(validator.handle_candidate(moved).await, Some(UpsertOutcome::Updated));

        assert_eq!(client.calls().len(), calls);
        let instance = registry.get("A").unwrap();
        assert_eq!(instance.ip_address(), "10.0.0.1");
        assert_eq!(instance.port(), 51900);
    }

    #[tokio::test]
    async fn test_blacklisted_candidate_is_never_probed() {
        let client = FakeClient::default().with_snapshot("10.0.0.1", snapshot());
        let (registry, client, validator) = validator(client, &["a".to_string()]);

        assert_eq!(validator.handle_candidate(candidate("A", &["10.0.0.1"])).await, None);
        assert!(registry.is_empty());
        assert!(client.calls().is_empty());
    }

    #[derive(Default)]
    struct FakeTransport {
        sender: Mutex<Option<mpsc::Sender<Candidate>>>,
        browses: Mutex<usize>,
        stops: Mutex<usize>,
    }

    impl FakeTransport {
        fn sender(&self) -> mpsc::Sender<Candidate> {
            self.sender.lock().clone().unwrap()
        }
    }

    impl DiscoveryTransport for FakeTransport {
        fn browse(&self) -> Result<mpsc::Receiver<Candidate>> {
            let (tx, rx) = mpsc::channel(8);
            *self.sender.lock() = Some(tx);
            *self.browses.lock() += 1;
            Ok(rx)
        }

        fn stop_browse(&self) -> Result<()> {
            *self.sender.lock() = None;
            *self.stops.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_candidate_stream_goes_idle() {
        let (_, _, validator) = validator(FakeClient::default(), &[]);
        let transport = Arc::new(FakeTransport::default());
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let (handle, task) = spawn(transport.clone(), validator, DiscoveryConfig::default(), cancel.clone());
        let mut state = handle.watch_state();
        state.wait_for(|s| *s == DiscoveryState::Browsing).await.unwrap();

        // Transport gives up without being asked to stop
        drop(transport.sender.lock().take());
        state.wait_for(|s| *s == DiscoveryState::Idle).await.unwrap();

        // Well before the window would have closed
        assert!(started.elapsed() < Duration::from_secs(60));
        handle.refresh().await.unwrap();
        state.wait_for(|s| *s == DiscoveryState::Browsing).await.unwrap();
        assert_eq!(*transport.browses.lock(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_browse_window_refresh_and_reset() {
        let client = FakeClient::default().with_snapshot("10.0.0.1", snapshot());
        let (registry, _, validator) = validator(client, &[]);
        let mut events = registry.subscribe();
        let transport = Arc::new(FakeTransport::default());
        let cancel = CancellationToken::new();

        let (handle, task) = spawn(transport.clone(), validator, DiscoveryConfig::default(), cancel.clone());
        let mut state = handle.watch_state();
        state.wait_for(|s| *s == DiscoveryState::Browsing).await.unwrap();
        assert_eq!(*transport.browses.lock(), 1);

        transport.sender().send(candidate("A", &["10.0.0.1"])).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::InstanceDiscovered(i) if i.username() == "A"));

        // Window closes on its own
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(handle.state(), DiscoveryState::Idle);
        assert_eq!(*transport.stops.lock(), 1);

        handle.refresh().await.unwrap();
        state.wait_for(|s| *s == DiscoveryState::Browsing).await.unwrap();
        assert_eq!(*transport.browses.lock(), 2);

        handle.reset_instance_pool().await.unwrap();
        state.wait_for(|s| *s == DiscoveryState::Idle).await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(*transport.browses.lock(), 2);

        // Browsing resumes after the reset delay
        state.wait_for(|s| *s == DiscoveryState::Browsing).await.unwrap();
        assert_eq!(*transport.browses.lock(), 3);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.state(), DiscoveryState::Idle);
    }
}
