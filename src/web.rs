//! Dashboard surface: JSON API + websocket event stream over the
//! incident store, rule engine, remediation log history and the
//! broadcast hub.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::broadcast::Hub;
use crate::remediation::{RemediationConfig, RemediationEngine};
use crate::rules::{Priority, RuleEngine, RuleSpec};
use crate::store::{IncidentFilter, IncidentStore, Pagination};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IncidentStore>,
    pub rules: Arc<RuleEngine>,
    pub rules_file: std::path::PathBuf,
    pub remediation: Arc<RemediationEngine>,
    pub hub: Arc<Hub>,
    pub cluster_reachable: Arc<std::sync::atomic::AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/incidents", get(list_incidents))
        .route("/api/incidents/{id}", get(get_incident))
        .route("/api/rules", get(list_rules))
        .route("/api/rules/test", axum::routing::post(test_pattern))
        .route("/api/rules/reload", axum::routing::post(reload_rules))
        .route("/api/remediations", get(list_remediations))
        .route("/api/remediations/incident/{id}", get(remediations_for_incident))
        .route("/api/stats", get(stats))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/ws", get(websocket_upgrade))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
                .layer(RequestBodyLimitLayer::new(64 * 1024)),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.cluster_reachable.load(std::sync::atomic::Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "cluster API unreachable")
    }
}

#[derive(Debug, Deserialize)]
struct IncidentQuery {
    namespace: Option<String>,
    priority: Option<String>,
    search: Option<String>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Serialize)]
struct Page<T> {
    items: Vec<T>,
    total: usize,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(q): Query<IncidentQuery>,
) -> impl IntoResponse {
    let priority = q.priority.as_deref().and_then(|p| p.parse::<Priority>().ok());
    let filter = IncidentFilter {
        namespace: q.namespace,
        priority,
        search: q.search,
    };
    let pagination = Pagination {
        offset: q.offset,
        limit: q.limit,
    };
    let (items, total) = state.store.list(filter, pagination).await;
    Json(Page { items, total })
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_by_id(&id).await {
        Some(incident) => Json(incident).into_response(),
        None => (StatusCode::NOT_FOUND, "incident not found").into_response(),
    }
}

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.rules.current_specs().await)
}

/// Re-read `rulesFile` from disk and hot-swap the engine. Rejected
/// (previous rule set preserved) if the file is unreadable, malformed, or
/// any rule fails to compile — mirrors `RuleEngine::update_rules`'s own
/// atomicity guarantee.
async fn reload_rules(State(state): State<AppState>) -> Response {
    let doc = match crate::rules::load(&state.rules_file) {
        Ok(doc) => doc,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match state.rules.update_rules(doc.rules).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TestPatternRequest {
    pattern: String,
    sample: String,
}

#[derive(Debug, Serialize)]
struct TestPatternResponse {
    matched: bool,
}

async fn test_pattern(Json(req): Json<TestPatternRequest>) -> Response {
    match RuleEngine::test_pattern(&req.pattern, &req.sample) {
        Ok(matched) => Json(TestPatternResponse { matched }).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

async fn list_remediations(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> impl IntoResponse {
    let (items, total) = state
        .store
        .list_remediation_logs(Pagination {
            offset: q.offset,
            limit: q.limit,
        })
        .await;
    Json(Page { items, total })
}

async fn remediations_for_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.store.list_remediation_logs_for_incident(&id).await)
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.stats().await)
}

/// Normalized settings shape shared by GET and PUT: a 1:1 mirror of
/// `RemediationConfig` rather than the broader `ConfigDocument` — the
/// only knobs meaningfully safe to change at runtime without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDto {
    enabled: bool,
    dry_run: bool,
    namespace_exclusions: Vec<String>,
    max_actions_per_hour: u32,
}

impl From<RemediationConfig> for SettingsDto {
    fn from(c: RemediationConfig) -> Self {
        Self {
            enabled: c.enabled,
            dry_run: c.dry_run,
            namespace_exclusions: c.namespace_exclusions,
            max_actions_per_hour: c.max_actions_per_hour,
        }
    }
}

impl From<SettingsDto> for RemediationConfig {
    fn from(d: SettingsDto) -> Self {
        Self {
            enabled: d.enabled,
            dry_run: d.dry_run,
            namespace_exclusions: d.namespace_exclusions,
            max_actions_per_hour: d.max_actions_per_hour,
        }
    }
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(SettingsDto::from(state.remediation.current_config().await))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(dto): Json<SettingsDto>,
) -> impl IntoResponse {
    state.remediation.update_config(dto.into()).await;
    StatusCode::NO_CONTENT
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.hub.subscribe().await;
    debug!(subscriber = %id, "websocket client attached");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize broadcast event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unsubscribe(id).await;
    debug!(subscriber = %id, "websocket client detached");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_dto_roundtrips_remediation_config() {
        let config = RemediationConfig {
            enabled: false,
            dry_run: true,
            namespace_exclusions: vec!["kube-system".to_string()],
            max_actions_per_hour: 5,
        };
        let dto = SettingsDto::from(config.clone());
        let back: RemediationConfig = dto.into();
        assert_eq!(back.enabled, config.enabled);
        assert_eq!(back.dry_run, config.dry_run);
        assert_eq!(back.namespace_exclusions, config.namespace_exclusions);
        assert_eq!(back.max_actions_per_hour, config.max_actions_per_hour);
    }

    #[test]
    fn settings_dto_serializes_camel_case() {
        let dto = SettingsDto {
            enabled: true,
            dry_run: false,
            namespace_exclusions: vec![],
            max_actions_per_hour: 30,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"dryRun\""));
        assert!(json.contains("\"maxActionsPerHour\""));
    }
}
