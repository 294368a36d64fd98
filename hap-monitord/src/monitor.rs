use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{STATUS_HAP_INSUFFICIENT_AUTHORIZATION, STATUS_UNAUTHORIZED};
use shared::types::CharacteristicsResponse;
use crate::model::Service;
use crate::protocol::{self, DecodedMessage, MessageDecoder};
use crate::registry::Instance;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Services whose values changed in one push message.
pub type ServiceUpdate = Vec<Arc<Service>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribing,
    Subscribed,
}

/// Event-capable characteristics of one instance.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub instance: Arc<Instance>,
    /// `(aid, iid)` pairs, in graph order
    pub characteristics: Vec<(u64, u64)>,
}

/// Keeps one evented connection per instance and applies pushed values to
/// the service graph it was built from.
pub struct Monitor {
    services: Vec<Arc<Service>>,
    subscriptions: Vec<Subscription>,
    pin: Arc<str>,
    events: broadcast::Sender<ServiceUpdate>,
    states: Arc<Mutex<HashMap<String, ConnectionState>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(services: Vec<Arc<Service>>, pin: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        let subscriptions = subscriptions(&services);
        let states = subscriptions
            .iter()
            .map(|s| (s.instance.username().to_string(), ConnectionState::Disconnected))
            .collect();

        Self {
            services,
            subscriptions,
            pin: Arc::from(pin),
            events,
            states: Arc::new(Mutex::new(states)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Register an observer for `service-update` batches.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceUpdate> {
        self.events.subscribe()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn state(&self, username: &str) -> ConnectionState {
        self.states
            .lock()
            .get(username)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Open a connection for every instance with event-capable characteristics.
    pub fn start(&mut self) {
        for subscription in &self.subscriptions {
            let connection = Connection {
                subscription: subscription.clone(),
                index: index_for(&self.services, subscription.instance.username()),
                pin: self.pin.clone(),
                events: self.events.clone(),
                states: self.states.clone(),
            };
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(connection.run(cancel)));
        }
    }

    /// True once any started connection has ended, whether it was refused,
    /// closed by the accessory or dropped on a read error.
    pub fn has_closed_connections(&self) -> bool {
        self.tasks.iter().any(|task| task.is_finished())
    }

    /// Merge polled values into the monitored graph. Returns false when the
    /// monitor has to be rebuilt instead: the layout changed or a connection
    /// has closed and needs reopening.
    pub fn refresh_values(&self, fresh: &[Arc<Service>]) -> bool {
        if self.has_closed_connections() {
            tracing::info!("Event connection closed, reopening");
            return false;
        }
        crate::model::merge_values(&self.services, fresh)
    }

    /// Close every connection. Errors on already dead connections are ignored.
    pub async fn finish(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Group the event-capable characteristics by instance.
pub fn subscriptions(services: &[Arc<Service>]) -> Vec<Subscription> {
    let mut subscriptions: Vec<Subscription> = Vec::new();

    for service in services {
        let ids: Vec<(u64, u64)> = service.event_characteristics().map(|c| (service.aid, c.iid)).collect();
        if ids.is_empty() {
            continue;
        }

        let username = service.instance.username();
        let position = match subscriptions.iter().position(|s| s.instance.username() == username) {
            Some(position) => position,
            None => {
                subscriptions.push(Subscription {
                    instance: service.instance.clone(),
                    characteristics: Vec::new(),
                });
                subscriptions.len() - 1
            }
        };

        let entry = &mut subscriptions[position].characteristics;
        for id in ids {
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
    }

    subscriptions
}

type ServiceIndex = HashMap<(u64, u64), Arc<Service>>;

/// `(aid, iid)` -> owning service, for one instance.
fn index_for(services: &[Arc<Service>], username: &str) -> ServiceIndex {
    services
        .iter()
        .filter(|s| s.instance.username() == username)
        .flat_map(|s| s.characteristics.iter().map(move |c| ((s.aid, c.iid), s.clone())))
        .collect()
}

/// Apply a push body to the graph. Returns the affected services, each once.
pub fn apply_event(index: &ServiceIndex, body: &[u8]) -> ServiceUpdate {
    let body: CharacteristicsResponse = match serde_json::from_slice(body) {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!("Ignoring unparseable event body: {}", e);
            return Vec::new();
        }
    };

    let mut updated: ServiceUpdate = Vec::new();
    for entry in body.characteristics {
        let (Ok(aid), Ok(iid)) = (u64::try_from(entry.aid), u64::try_from(entry.iid)) else {
            continue;
        };
        let Some(service) = index.get(&(aid, iid)) else {
            continue;
        };
        let Some(characteristic) = service.characteristic(iid) else {
            continue;
        };

        characteristic.set_value(entry.value);
        if !updated.iter().any(|s| Arc::ptr_eq(s, service)) {
            updated.push(service.clone());
        }
    }
    updated
}

struct Connection {
    subscription: Subscription,
    index: ServiceIndex,
    pin: Arc<str>,
    events: broadcast::Sender<ServiceUpdate>,
    states: Arc<Mutex<HashMap<String, ConnectionState>>>,
}

impl Connection {
    fn label(&self) -> String {
        format!(
            "{} ({})",
            self.subscription.instance.socket_addr(),
            self.subscription.instance.username()
        )
    }

    fn set_state(&self, state: ConnectionState) {
        self.states
            .lock()
            .insert(self.subscription.instance.username().to_string(), state);
    }

    async fn run(self, cancel: CancellationToken) {
        let address = self.subscription.instance.socket_addr();

        let stream = tokio::select! {
            result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)) => result,
            _ = cancel.cancelled() => return,
        };
        let mut stream = match stream {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!("[{}] Failed to connect: {}", self.label(), e);
                return;
            }
            Err(_) => {
                tracing::warn!("[{}] Connection timed out", self.label());
                return;
            }
        };

        let request = match protocol::subscribe_request(&address, &self.pin, &self.subscription.characteristics) {
            Ok(request) => request.encode(),
            Err(e) => {
                tracing::error!("[{}] Failed to encode subscription: {}", self.label(), e);
                return;
            }
        };
        if let Err(e) = stream.write_all(&request).await {
            tracing::warn!("[{}] Failed to send subscription: {}", self.label(), e);
            return;
        }

        self.set_state(ConnectionState::Subscribing);
        tracing::debug!(
            "[{}] Connected, subscribing to {} characteristics",
            self.label(),
            self.subscription.characteristics.len()
        );

        let mut decoder = MessageDecoder::new(self.subscription.instance.username());
        let mut read_buf = [0u8; 8192];

        loop {
            tokio::select! {
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by accessory", self.label());
                            break;
                        }
                        Ok(n) => {
                            let Some(received) = read_buf.get(..n) else {
                                break;
                            };
                            for message in decoder.feed(received) {
                                self.handle_message(message);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", self.label(), e);
                            break;
                        }
                    }
                }

                _ = cancel.cancelled() => {
                    let _ = stream.shutdown().await;
                    tracing::debug!("[{}] Disconnected", self.label());
                    break;
                }
            }
        }

        if let Some(partial) = decoder.finish() {
            tracing::debug!(
                "[{}] Discarding {} bytes of incomplete message",
                partial.connection_id,
                partial.len
            );
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_message(&self, message: DecodedMessage) {
        if message.is_event() {
            let updated = apply_event(&self.index, &message.body);
            tracing::debug!(
                "[{}] Got event: {}",
                self.label(),
                String::from_utf8_lossy(&message.body)
            );
            self.set_state(ConnectionState::Subscribed);
            if !updated.is_empty() {
                let _ = self.events.send(updated);
            }
            return;
        }

        match message.status_code {
            Some(code) if code == STATUS_UNAUTHORIZED || code == STATUS_HAP_INSUFFICIENT_AUTHORIZATION => {
                tracing::warn!(
                    "[{}] {} {} - make sure the Homebridge pin for this instance is set to {}.",
                    self.label(),
                    code,
                    message.status_message,
                    self.pin
                );
            }
            Some(code) if (200..300).contains(&code) => {
                self.set_state(ConnectionState::Subscribed);
            }
            Some(code) => {
                tracing::debug!("[{}] Subscription answered {} {}", self.label(), code, message.status_message);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use crate::model::{self, tests::{test_instance, test_snapshot}};
    use crate::registry::InstanceRecord;

    fn event(body: &Value) -> Vec<u8> {
        let body = body.to_string();
        format!(
            "EVENT/1.0 200 OK\r\nContent-Type: application/hap+json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_subscriptions_group_by_instance() {
        let a = model::build(&test_instance("A"), &test_snapshot());
        let b = model::build(&test_instance("B"), &test_snapshot());
        let services: Vec<Arc<Service>> = a.into_iter().chain(b).collect();

        let subscriptions = subscriptions(&services);

        assert_eq!(subscriptions.len(), 2);
        assert_eq!(subscriptions[0].instance.username(), "A");
        assert_eq!(subscriptions[0].characteristics, vec![(1, 10), (1, 12)]);
    }

    #[test]
    fn test_instances_without_events_are_skipped() {
        let mut snapshot = test_snapshot();
        for service in &mut snapshot.accessories[0].services {
            for characteristic in &mut service.characteristics {
                characteristic.perms.retain(|p| *p != shared::types::Perm::Events);
            }
        }
        let services = model::build(&test_instance("A"), &snapshot);

        assert!(subscriptions(&services).is_empty());
        assert!(Monitor::new(services, "031-45-154").subscriptions().is_empty());
    }

    #[test]
    fn test_apply_event_updates_only_target() {
        let services = model::build(&test_instance("A"), &test_snapshot());
        let index = index_for(&services, "A");

        let updated = apply_event(&index, br#"{"characteristics":[{"aid":1,"iid":12,"value":72}]}"#);

        assert_eq!(updated.len(), 1);
        assert!(Arc::ptr_eq(&updated[0], &services[1]));
        assert_eq!(services[1].characteristic(12).unwrap().value(), json!(72));
        assert_eq!(services[0].characteristic(10).unwrap().value(), json!(false));
    }

    #[test]
    fn test_apply_event_ignores_unknown_ids() {
        let services = model::build(&test_instance("A"), &test_snapshot());
        let index = index_for(&services, "A");

        let updated = apply_event(&index, br#"{"characteristics":[{"aid":1,"iid":99,"value":1},{"aid":-1,"iid":-1}]}"#);

        assert!(updated.is_empty());
        assert_eq!(services[1].characteristic(12).unwrap().value(), json!(21.5));
        assert!(apply_event(&index, b"not json").is_empty());
    }

    #[test]
    fn test_apply_event_batches_each_service_once() {
        let services = model::build(&test_instance("A"), &test_snapshot());
        let index = index_for(&services, "A");

        let updated = apply_event(
            &index,
            br#"{"characteristics":[{"aid":1,"iid":12,"value":1},{"aid":1,"iid":12,"value":2},{"aid":1,"iid":10,"value":true}]}"#,
        );

        assert_eq!(updated.len(), 2);
        assert_eq!(services[1].characteristic(12).unwrap().value(), json!(2), "Later entries win");
    }

    #[test]
    fn test_index_is_scoped_to_instance() {
        let a = model::build(&test_instance("A"), &test_snapshot());
        let b = model::build(&test_instance("B"), &test_snapshot());
        let services: Vec<Arc<Service>> = a.into_iter().chain(b).collect();

        apply_event(&index_for(&services, "B"), br#"{"characteristics":[{"aid":1,"iid":12,"value":5}]}"#);

        assert_eq!(services[1].characteristic(12).unwrap().value(), json!(21.5));
        assert_eq!(services[3].characteristic(12).unwrap().value(), json!(5));
    }

    /// Accepts one connection, checks the subscription, sends `replies`
    /// and waits for the client to hang up. Returns the number of requests seen.
    async fn fake_accessory(listener: TcpListener, replies: Vec<Vec<u8>>, done: oneshot::Sender<usize>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = MessageDecoder::new("accessory");
        let mut buf = [0u8; 4096];
        let mut requests = Vec::new();

        while requests.is_empty() {
            let n = socket.read(&mut buf).await.unwrap();
            requests.extend(decoder.feed(&buf[..n]));
        }

        let request = &requests[0];
        assert_eq!(request.protocol, "PUT");
        assert_eq!(request.header("authorization"), Some("031-45-154"));
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(
            body,
            json!({"characteristics": [
                {"aid": 1, "iid": 10, "ev": true},
                {"aid": 1, "iid": 12, "ev": true}
            ]})
        );

        for reply in replies {
            socket.write_all(&reply).await.unwrap();
        }

        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => requests.extend(decoder.feed(&buf[..n])),
            }
        }
        let _ = done.send(requests.len());
    }

    async fn monitored(replies: Vec<Vec<u8>>) -> (Monitor, Vec<Arc<Service>>, oneshot::Receiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(fake_accessory(listener, replies, done_tx));

        let instance = Arc::new(Instance::new(InstanceRecord {
            username: "A".to_string(),
            name: "Homebridge".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port,
        }));
        let services = model::build(&instance, &test_snapshot());
        (Monitor::new(services.clone(), "031-45-154"), services, done_rx)
    }

    #[tokio::test]
    async fn test_end_to_end_push() {
        let push = json!({"characteristics": [{"aid": 1, "iid": 12, "value": 72}]});
        let (mut monitor, services, done) =
            monitored(vec![b"HTTP/1.1 204 No Content\r\n\r\n".to_vec(), event(&push)]).await;
        let mut updates = monitor.subscribe();
        assert_eq!(monitor.state("A"), ConnectionState::Disconnected);

        monitor.start();
        let batch = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].unique_id, services[1].unique_id);
        assert_eq!(services[1].values().get("CurrentTemperature"), Some(&json!(72)));
        assert_eq!(monitor.state("A"), ConnectionState::Subscribed);

        monitor.finish().await;
        assert_eq!(monitor.state("A"), ConnectionState::Disconnected);
        assert_eq!(done.await.unwrap(), 1, "Exactly one subscribe request");
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stays_attached_after_auth_failure() {
        let push = json!({"characteristics": [{"aid": 1, "iid": 10, "value": true}]});
        let (mut monitor, services, done) = monitored(vec![
            b"HTTP/1.1 470 Connection Authorization Required\r\nContent-Length: 0\r\n\r\n".to_vec(),
            event(&push),
        ])
        .await;
        let mut updates = monitor.subscribe();

        monitor.start();
        let batch = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&batch[0], &services[0]));
        assert_eq!(services[0].characteristic(10).unwrap().value(), json!(true));

        monitor.finish().await;
        done.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_can_be_reopened() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // First connection is hung up right after the subscribe request,
        // the second one is accepted and kept open
        let accessory = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            for attempt in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut decoder = MessageDecoder::new("accessory");
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if !decoder.feed(&buf[..n]).is_empty() {
                        break;
                    }
                }
                if attempt == 0 {
                    drop(socket);
                    continue;
                }
                socket.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
                while !matches!(socket.read(&mut buf).await, Ok(0) | Err(_)) {}
            }
        });

        let instance = Arc::new(Instance::new(InstanceRecord {
            username: "A".to_string(),
            name: "Homebridge".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port,
        }));
        let services = model::build(&instance, &test_snapshot());

        let mut first = Monitor::new(services.clone(), "031-45-154");
        first.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !first.has_closed_connections() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(first.state("A"), ConnectionState::Disconnected);
        assert!(!first.refresh_values(&model::build(&instance, &test_snapshot())));
        first.finish().await;

        let mut second = Monitor::new(services.clone(), "031-45-154");
        second.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while second.state("A") != ConnectionState::Subscribed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!second.has_closed_connections());
        let fresh = model::build(&instance, &test_snapshot());
        fresh[1].characteristic(12).unwrap().set_value(json!(19.5));
        assert!(second.refresh_values(&fresh));
        assert_eq!(second.services()[1].characteristic(12).unwrap().value(), json!(19.5));

        second.finish().await;
        accessory.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_cancels_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            while !matches!(socket.read(&mut buf).await, Ok(0) | Err(_)) {}
            let _ = closed_tx.send(());
        });

        let instance = Arc::new(Instance::new(InstanceRecord {
            username: "A".to_string(),
            name: "Homebridge".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port,
        }));
        let mut monitor = Monitor::new(model::build(&instance, &test_snapshot()), "031-45-154");
        monitor.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.state("A") != ConnectionState::Subscribing {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        drop(monitor);
        tokio::time::timeout(Duration::from_secs(5), closed_rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finish_without_start() {
        let services = model::build(&test_instance("A"), &test_snapshot());
        let mut monitor = Monitor::new(services, "031-45-154");
        monitor.finish().await;
        assert_eq!(monitor.state("A"), ConnectionState::Disconnected);
    }
}
