use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use hap_monitord::api;
use hap_monitord::client::{AccessoryClient, HttpClient};
use hap_monitord::config::Config;
use hap_monitord::discovery::{self, DiscoveryHandle, DiscoveryState, Validator};
use hap_monitord::mdns::browser::MdnsTransport;
use hap_monitord::model::Service;
use hap_monitord::monitor::{Monitor, ServiceUpdate};
use hap_monitord::poller::Poller;
use hap_monitord::registry::{Registry, RegistryEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hap_monitord=info"))
        )
        .init();

    tracing::info!("Starting hap-monitord");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/hap-monitord/hap-monitord.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let registry = Arc::new(Registry::new(&config.hap.blacklist));
    let client: Arc<dyn AccessoryClient> = Arc::new(
        HttpClient::new(config.poll.request_timeout()).context("Failed to create HTTP client")?,
    );

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;

    let cancel = CancellationToken::new();

    let validator = Validator::new(
        registry.clone(),
        client.clone(),
        &config.hap.pin,
        config.discovery.probe_timeout(),
    );
    let (discovery, discovery_task) = discovery::spawn(
        Arc::new(MdnsTransport::new(mdns_daemon.clone())),
        validator,
        config.discovery.clone(),
        cancel.clone(),
    );

    let (services_tx, services_rx) = watch::channel(Arc::new(Vec::new()));

    let app_state = api::routes::AppState {
        registry: registry.clone(),
        services_rx,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    let monitor_cancel = cancel.clone();
    let supervisor = Supervisor {
        poller: Poller::new(registry.clone(), client, config.poll.request_timeout()),
        registry,
        discovery,
        services_tx,
        pin: config.hap.pin.clone(),
        monitor: None,
        updates: None,
    };
    let interval = config.poll.interval();
    let supervisor_handle = tokio::spawn(async move { supervisor.run(interval, monitor_cancel).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(discovery_task, server_handle, supervisor_handle);

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Polls on a timer and whenever the registry changes, and keeps one live
/// monitor attached to the current service graph.
struct Supervisor {
    poller: Poller,
    registry: Arc<Registry>,
    discovery: DiscoveryHandle,
    services_tx: watch::Sender<Arc<Vec<Arc<Service>>>>,
    pin: String,
    monitor: Option<Monitor>,
    updates: Option<broadcast::Receiver<ServiceUpdate>>,
}

async fn next_update(updates: &mut Option<broadcast::Receiver<ServiceUpdate>>) -> Result<ServiceUpdate, broadcast::error::RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Supervisor {
    async fn run(mut self, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut registry_events = self.registry.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.registry.is_empty() && self.discovery.state() == DiscoveryState::Idle {
                        if let Err(e) = self.discovery.refresh().await {
                            tracing::error!("Failed to refresh discovery: {}", e);
                        }
                    }
                    self.refresh(false).await;
                }

                event = registry_events.recv() => {
                    match event {
                        Ok(RegistryEvent::InstanceDiscovered(instance)) => {
                            tracing::debug!("Rebuilding graph for {}", instance.label());
                            self.refresh(true).await;
                        }
                        Ok(RegistryEvent::InstanceEvicted(username)) => {
                            tracing::debug!("Rebuilding graph without {}", username);
                            self.refresh(true).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("Missed {} registry events", n);
                            self.refresh(true).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                update = next_update(&mut self.updates) => {
                    match update {
                        Ok(services) => {
                            for service in services {
                                tracing::info!(
                                    "[{}] {} updated: {}",
                                    service.instance.label(),
                                    service.service_name,
                                    serde_json::to_string(&service.values()).unwrap_or_default()
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Dropped {} service updates", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => self.updates = None,
                    }
                }

                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        if let Some(mut monitor) = self.monitor.take() {
            monitor.finish().await;
        }
    }

    /// Poll every instance. Values are merged into the monitored graph when
    /// its layout is unchanged and all its connections are open, otherwise
    /// the monitor is rebuilt.
    async fn refresh(&mut self, force_rebuild: bool) {
        let fresh = self.poller.get_all_services().await;

        if !force_rebuild {
            if let Some(monitor) = &self.monitor {
                if monitor.refresh_values(&fresh) {
                    tracing::debug!("Refreshed {} services", fresh.len());
                    return;
                }
            }
        }

        if let Some(mut monitor) = self.monitor.take() {
            monitor.finish().await;
        }

        tracing::info!("Monitoring {} services", fresh.len());
        self.services_tx.send_replace(Arc::new(fresh.clone()));

        let mut monitor = Monitor::new(fresh, &self.pin);
        self.updates = Some(monitor.subscribe());
        monitor.start();
        self.monitor = Some(monitor);
    }
}
