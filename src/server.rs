//! Health, metrics and status endpoint
//!
//! # Routes
//!
//! - `GET /healthz` - liveness, always `ok`
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /status` - observed status of every profile and shared list

use crate::metrics;
use crate::resources::{ListKind, ProfileStatus, SharedListStatus};
use crate::store::ResourceStore;
use crate::{OperatorError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn ResourceStore>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileSummary {
    namespace: String,
    name: String,
    generation: i64,
    deleting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ProfileStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListSummary {
    kind: ListKind,
    namespace: String,
    name: String,
    generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<SharedListStatus>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    profiles: Vec<ProfileSummary>,
    lists: Vec<ListSummary>,
}

pub struct StatusServer {
    state: AppState,
}

impl StatusServer {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            state: AppState { store },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status))
            .with_state(self.state.clone())
    }

    /// Serve on `addr` until `shutdown` flips to true
    pub async fn run(self, addr: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OperatorError::Other(format!("failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = addr, "Status server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;
        Ok(())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

async fn status(State(state): State<AppState>) -> Response {
    match collect_status(state.store.as_ref()).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read status");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn collect_status(store: &dyn ResourceStore) -> Result<StatusResponse> {
    let mut profiles: Vec<ProfileSummary> = store
        .list_profiles(None)
        .await?
        .into_iter()
        .map(|p| ProfileSummary {
            deleting: p.metadata.is_deleting(),
            namespace: p.metadata.namespace,
            name: p.metadata.name,
            generation: p.metadata.generation,
            status: p.status,
        })
        .collect();
    profiles.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let mut lists = Vec::new();
    for kind in ListKind::ALL {
        let mut of_kind: Vec<ListSummary> = store
            .list_lists(kind, None)
            .await?
            .into_iter()
            .map(|l| ListSummary {
                kind,
                namespace: l.metadata.namespace,
                name: l.metadata.name,
                generation: l.metadata.generation,
                status: l.status,
            })
            .collect();
        of_kind.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        lists.extend(of_kind);
    }

    Ok(StatusResponse { profiles, lists })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ObjectMeta, Profile, ProfileSpec, SharedList, SharedListSpec};
    use crate::store::InMemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn server() -> StatusServer {
        let store = Arc::new(InMemoryStore::new());
        store
            .apply_profile(Profile::new(
                ObjectMeta::new("home", "kids"),
                ProfileSpec::new("Kids", "creds"),
            ))
            .await
            .unwrap();
        store
            .apply_list(SharedList::new(
                ListKind::Denylist,
                ObjectMeta::new("home", "social"),
                SharedListSpec::default(),
            ))
            .await;
        StatusServer::new(store)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get(server().await.router(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics() {
        metrics::set_health_status(true);
        let (status, body) = get(server().await.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("nextdns_operator_health_status"));
    }

    #[tokio::test]
    async fn test_status_lists_objects() {
        let (status, body) = get(server().await.router(), "/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["profiles"][0]["name"], "kids");
        assert_eq!(json["profiles"][0]["generation"], 1);
        assert_eq!(json["lists"][0]["kind"], "Denylist");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get(server().await.router(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
