//! Axum surface for adpulse: CRM webhook receiver and on-demand company sync.

use std::sync::Arc;

use adpulse_storage::PgStore;
use adpulse_sync::{
    maybe_build_scheduler, CardEvent, CompanySyncReport, Orchestrator, SyncConfig, SyncError,
};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Optional force-sync body. A missing `until` means today; a missing `since`
/// means the configured lookback before `until`.
#[derive(Debug, Default, Deserialize)]
struct SyncWindow {
    since: Option<NaiveDate>,
    until: Option<NaiveDate>,
}

#[derive(Debug)]
enum ApiError {
    Sync(SyncError),
    InvalidRequest(String),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Sync(err) => {
                let status = match &err {
                    SyncError::CompanyNotFound(_) | SyncError::UnknownPipeline(_) => {
                        StatusCode::NOT_FOUND
                    }
                    SyncError::InvalidEvent(_) | SyncError::InvalidWindow { .. } => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
            ApiError::InvalidRequest(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/crm", post(crm_webhook_handler))
        .route("/companies/{company_id}/sync", post(force_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Connects Postgres, wires the orchestrator and serves until shutdown.
/// Starts the cron scheduler alongside when it is enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config, Arc::new(store))?);

    let scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    serve(config.web_port, AppState::new(orchestrator)).await
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn crm_webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let event = CardEvent::from_json(payload)?;
    let action = event.action.clone();
    match state.orchestrator.handle_card_event(event).await? {
        Some(outcome) => Ok(Json(json!({ "status": "processed", "outcome": outcome }))),
        None => {
            info!(%action, "card event ignored");
            Ok(Json(json!({ "status": "ignored" })))
        }
    }
}

async fn force_sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
    body: Bytes,
) -> Result<Json<CompanySyncReport>, ApiError> {
    let window: SyncWindow = if body.iter().all(u8::is_ascii_whitespace) {
        SyncWindow::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::InvalidRequest(format!("invalid sync window: {err}")))?
    };

    let range = state
        .orchestrator
        .resolve_window(window.since, window.until)?;
    let report = state.orchestrator.sync_company(company_id, range).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_adapters::testing::ScriptedTransport;
    use adpulse_adapters::{AdsFetcherConfig, CrmFetcherConfig, RuleSet};
    use adpulse_core::{Integration, IntegrationSettings, SourceKind};
    use adpulse_storage::MemoryStore;
    use adpulse_sync::{OrchestratorSettings, PlaintextVault};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(store: Arc<MemoryStore>, transport: ScriptedTransport) -> AppState {
        let orchestrator = Orchestrator::new(
            store,
            Arc::new(PlaintextVault),
            Arc::new(transport),
            Arc::new(RuleSet::builtin().unwrap()),
            OrchestratorSettings {
                ads: AdsFetcherConfig {
                    api_base: "https://ads.test".into(),
                    ..AdsFetcherConfig::default()
                },
                crm: CrmFetcherConfig {
                    api_url: "https://crm.test/graphql".into(),
                    ..CrmFetcherConfig::default()
                },
                ..OrchestratorSettings::default()
            },
        );
        AppState::new(Arc::new(orchestrator))
    }

    fn integration(company_id: Uuid, source: SourceKind) -> Integration {
        Integration {
            id: Uuid::new_v4(),
            company_id,
            source,
            credentials: Some("token".into()),
            account_id: Some("42".into()),
            pipeline_id: Some("301".into()),
            active: true,
            settings: IntegrationSettings::default(),
            last_sync_at: None,
        }
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(state(Arc::new(MemoryStore::new()), ScriptedTransport::default()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_status_codes() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_integration(integration(Uuid::new_v4(), SourceKind::Crm))
            .await;
        let app = app(state(store.clone(), ScriptedTransport::default()));

        let unknown = app
            .clone()
            .oneshot(post_json(
                "/webhooks/crm",
                json!({ "action": "card.create", "data": { "card": { "id": 1, "pipe": { "id": 999 } } } }),
            ))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let malformed = app
            .clone()
            .oneshot(post_json("/webhooks/crm", json!({ "action": "card.create" })))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let ok = app
            .oneshot(post_json(
                "/webhooks/crm",
                json!({ "action": "card.create", "data": { "card": {
                    "id": 1,
                    "title": "Seguro Auto",
                    "created_at": "2026-01-05T10:00:00Z",
                    "current_phase": { "id": 3, "name": "Novo" },
                    "pipe": { "id": 301 }
                } } }),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["status"], "processed");
        assert_eq!(body["outcome"]["status"], "success");
        assert_eq!(store.deals().await.len(), 1);
    }

    #[tokio::test]
    async fn force_sync_runs_the_requested_window() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        store.add_integration(integration(company, SourceKind::Ads)).await;
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "data": [{
                "campaign_id": "9",
                "campaign_name": "Auto Fevereiro",
                "spend": "12.5",
                "date_start": "2026-02-01"
            }]
        }))]);
        let app = app(state(store.clone(), transport));

        let resp = app
            .oneshot(post_json(
                &format!("/companies/{company}/sync"),
                json!({ "since": "2026-02-01", "until": "2026-02-01" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["window"]["since"], "2026-02-01");
        assert_eq!(body["outcomes"][0]["status"], "success");
        assert_eq!(store.buckets().await.len(), 2);
    }

    #[tokio::test]
    async fn force_sync_rejects_unknown_company_and_inverted_window() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        store.add_company(company).await;
        let app = app(state(store, ScriptedTransport::default()));

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/companies/{}/sync", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let inverted = app
            .oneshot(post_json(
                &format!("/companies/{company}/sync"),
                json!({ "since": "2026-03-01", "until": "2026-02-01" }),
            ))
            .await
            .unwrap();
        assert_eq!(inverted.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(inverted).await["error"]
            .as_str()
            .unwrap()
            .contains("after"));
    }
}
