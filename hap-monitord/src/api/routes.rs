use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use shared::types::InstanceInfo;
use crate::model::Service;
use crate::registry::Registry;

/// Latest service graph, replaced wholesale after every poll.
pub type ServiceGraph = Arc<Vec<Arc<Service>>>;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub services_rx: watch::Receiver<ServiceGraph>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/instances", get(get_instances))
        .route("/v1/services", get(get_services))
        .route("/v1/services/:unique_id", get(get_service))
        .with_state(state)
}

async fn get_instances(State(state): State<AppState>) -> Json<Vec<InstanceInfo>> {
    Json(state.registry.list().iter().map(|i| i.info()).collect())
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Json<Vec<Arc<Service>>> {
    let graph = state.services_rx.borrow().clone();
    let services = match params.service_type {
        Some(service_type) => graph
            .iter()
            .filter(|s| s.type_name == service_type)
            .cloned()
            .collect(),
        None => graph.to_vec(),
    };
    Json(services)
}

async fn get_service(
    State(state): State<AppState>,
    Path(unique_id): Path<String>,
) -> Result<Json<Arc<Service>>, StatusCode> {
    state
        .services_rx
        .borrow()
        .iter()
        .find(|s| s.unique_id == unique_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, tests::{test_instance, test_snapshot}};

    fn state() -> (AppState, ServiceGraph) {
        let registry = Arc::new(Registry::new(&[]));
        let graph: ServiceGraph = Arc::new(model::build(&test_instance("A"), &test_snapshot()));
        let (_tx, services_rx) = watch::channel(graph.clone());
        (AppState { registry, services_rx }, graph)
    }

    #[tokio::test]
    async fn test_get_services_filters_by_type() {
        let (state, _) = state();

        let Json(all) = get_services(State(state.clone()), Query(ServiceQuery { service_type: None })).await;
        assert_eq!(all.len(), 2);

        let Json(switches) = get_services(
            State(state),
            Query(ServiceQuery { service_type: Some("Switch".to_string()) }),
        )
        .await;
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].iid, 8);
    }

    #[tokio::test]
    async fn test_get_service_by_unique_id() {
        let (state, graph) = state();

        let Ok(Json(service)) = get_service(State(state.clone()), Path(graph[1].unique_id.clone())).await else {
            panic!("service not found");
        };
        assert_eq!(service.type_name, "TemperatureSensor");

        let missing = get_service(State(state), Path("nope".to_string())).await;
        assert!(matches!(missing, Err(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn test_get_instances() {
        let (state, _) = state();
        state.registry.upsert(crate::registry::InstanceRecord {
            username: "A".to_string(),
            name: "Homebridge".to_string(),
            ip_address: "10.0.0.1".to_string(),
            port: 51826,
        });

        let Json(instances) = get_instances(State(state)).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].username, "A");
    }
}
