use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use shared::types::AccessoriesResponse;
use crate::client::AccessoryClient;
use crate::error::HapError;
use crate::model::{self, Service};
use crate::registry::{Instance, Registry};

/// Fetches every registered instance's snapshot and builds the service graph.
#[derive(Clone)]
pub struct Poller {
    registry: Arc<Registry>,
    client: Arc<dyn AccessoryClient>,
    timeout: Duration,
}

impl Poller {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn AccessoryClient>, timeout: Duration) -> Self {
        Self { registry, client, timeout }
    }

    /// Poll all instances concurrently. Failures feed the registry's counters
    /// and are left out of the result.
    pub async fn poll(&self) -> Vec<(Arc<Instance>, AccessoriesResponse)> {
        let instances = self.registry.list();
        let results = join_all(instances.into_iter().map(|instance| async move {
            let result = match tokio::time::timeout(
                self.timeout,
                self.client.get_accessories(&instance, self.timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HapError::Timeout { url: instance.base_url() }),
            };
            (instance, result)
        }))
        .await;

        let mut snapshots = Vec::new();
        for (instance, result) in results {
            match result {
                Ok(snapshot) => {
                    self.registry.record_success(instance.username());
                    snapshots.push((instance, snapshot));
                }
                Err(e) => {
                    if e.is_unreachable() {
                        tracing::warn!("Failed to connect to instance {}: {}", instance.label(), e);
                    } else {
                        tracing::warn!("Instance {} returned an unusable snapshot: {}", instance.label(), e);
                    }
                    if self.registry.record_failure(instance.username()) {
                        tracing::warn!("Instance {} removed after repeated failures", instance.label());
                    }
                }
            }
        }
        snapshots
    }

    /// One full Model Builder run.
    pub async fn get_all_services(&self) -> Vec<Arc<Service>> {
        let snapshots = self.poll().await;
        model::build_all(&snapshots)
    }

    pub async fn get_service(&self, iid: u64) -> Option<Arc<Service>> {
        self.get_all_services().await.into_iter().find(|s| s.iid == iid)
    }

    pub async fn get_service_by_name(&self, service_name: &str) -> Option<Arc<Service>> {
        self.get_all_services()
            .await
            .into_iter()
            .find(|s| s.service_name == service_name)
    }
}
