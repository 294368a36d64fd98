use std::collections::HashMap;
use tokio::sync::mpsc;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use anyhow::{Context, Result};
use shared::protocol::{HAP_SERVICE_TYPE, TXT_DEVICE_ID, TXT_MODEL};
use crate::discovery::{Candidate, DiscoveryTransport};

/// Browses `_hap._tcp` through an mdns-sd daemon.
pub struct MdnsTransport {
    daemon: ServiceDaemon,
}

impl MdnsTransport {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon }
    }
}

impl DiscoveryTransport for MdnsTransport {
    fn browse(&self) -> Result<mpsc::Receiver<Candidate>> {
        let receiver = self
            .daemon
            .browse(HAP_SERVICE_TYPE)
            .with_context(|| format!("Failed to browse {}", HAP_SERVICE_TYPE))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(forward_resolved(receiver, tx));

        Ok(rx)
    }

    fn stop_browse(&self) -> Result<()> {
        self.daemon
            .stop_browse(HAP_SERVICE_TYPE)
            .with_context(|| format!("Failed to stop browsing {}", HAP_SERVICE_TYPE))
    }
}

/// Forward resolved services as candidates until the search stops or the
/// discovery side drops its receiver.
async fn forward_resolved(receiver: flume::Receiver<ServiceEvent>, tx: mpsc::Sender<Candidate>) {
    loop {
        match receiver.recv_async().await {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let Some(candidate) = convert_service_info(&info) else {
                    continue;
                };
                tracing::debug!("Resolved {} ({})", candidate.name, candidate.username);
                if tx.send(candidate).await.is_err() {
                    break;
                }
            }
            Ok(ServiceEvent::SearchStopped(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("mDNS receiver closed: {}", e);
                break;
            }
        }
    }
}

/// Convert an mdns-sd ServiceInfo to a discovery candidate
fn convert_service_info(info: &mdns_sd::ServiceInfo) -> Option<Candidate> {
    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    candidate_from_txt(
        info.get_fullname(),
        &txt,
        info.get_port(),
        info.get_addresses().iter().map(|addr| addr.to_string()).collect(),
    )
}

fn candidate_from_txt(
    fullname: &str,
    txt: &HashMap<String, String>,
    port: u16,
    mut addresses: Vec<String>,
) -> Option<Candidate> {
    let Some(username) = txt.get(TXT_DEVICE_ID) else {
        tracing::debug!("Skipping {} - no device id in TXT record", fullname);
        return None;
    };

    let name = txt
        .get(TXT_MODEL)
        .cloned()
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or(fullname).to_string());

    addresses.sort();

    Some(Candidate {
        username: username.clone(),
        name,
        port,
        addresses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_from_txt() {
        let txt = HashMap::from([
            ("id".to_string(), "0E:AA:CE:2B:35:71".to_string()),
            ("md".to_string(), "Homebridge 3571".to_string()),
            ("c#".to_string(), "2".to_string()),
        ]);

        let candidate = candidate_from_txt(
            "Homebridge 3571._hap._tcp.local.",
            &txt,
            51826,
            vec!["192.168.1.20".to_string(), "fe80::1".to_string()],
        )
        .unwrap();

        assert_eq!(candidate.username, "0E:AA:CE:2B:35:71");
        assert_eq!(candidate.name, "Homebridge 3571");
        assert_eq!(candidate.port, 51826);
        assert_eq!(candidate.addresses.len(), 2);
    }

    #[test]
    fn test_candidate_requires_device_id() {
        let txt = HashMap::from([("md".to_string(), "Bridge".to_string())]);
        assert!(candidate_from_txt("Bridge._hap._tcp.local.", &txt, 1, vec![]).is_none());
    }

    #[tokio::test]
    async fn test_forward_stops_on_search_stopped() {
        let (events_tx, events_rx) = flume::unbounded();
        let (tx, mut rx) = mpsc::channel(4);

        events_tx.send(ServiceEvent::SearchStarted(HAP_SERVICE_TYPE.to_string())).unwrap();
        events_tx.send(ServiceEvent::SearchStopped(HAP_SERVICE_TYPE.to_string())).unwrap();
        forward_resolved(events_rx, tx).await;

        assert!(rx.recv().await.is_none(), "Sender is dropped once the search stops");
    }

    #[test]
    fn test_name_falls_back_to_instance_name() {
        let txt = HashMap::from([("id".to_string(), "AA".to_string())]);
        let candidate = candidate_from_txt("Bridge._hap._tcp.local.", &txt, 1, vec![]).unwrap();
        assert_eq!(candidate.name, "Bridge");
    }
}
