//! HTTP trigger surface for the tender sync pipeline.
//!
//! Two GET endpoints drive the walk: `/sync` pages the publication endpoint
//! for a caller-supplied range, `/sync/delta` pages the update endpoint.
//! Both respond with the JSON status contract the surrounding application
//! polls; an interrupted run reports the page to resume from instead of
//! failing.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pncp_client::{TenderEndpoint, TenderSource};
use pncp_core::DateRange;
use pncp_storage::SyncStore;
use pncp_sync::{RunOutcome, SyncPipeline, SyncRunSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pncp-web";

/// Seam between the handlers and the pipeline; handler tests stub it.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_sync(
        &self,
        endpoint: TenderEndpoint,
        range: DateRange,
    ) -> anyhow::Result<SyncRunSummary>;
}

#[async_trait]
impl<S, C> SyncRunner for SyncPipeline<S, C>
where
    S: SyncStore + 'static,
    C: TenderSource + 'static,
{
    async fn run_sync(
        &self,
        endpoint: TenderEndpoint,
        range: DateRange,
    ) -> anyhow::Result<SyncRunSummary> {
        Ok(self.run(endpoint, range).await)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn SyncRunner>,
}

impl AppState {
    pub fn new(runner: Arc<dyn SyncRunner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(rename = "dataInicial")]
    pub data_inicial: String,
    #[serde(rename = "dataFinal")]
    pub data_final: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalidade: Option<u8>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync", get(sync_handler))
        .route("/sync/delta", get(delta_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("PNCP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    trigger(state, TenderEndpoint::Publication, query).await
}

async fn delta_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    trigger(state, TenderEndpoint::Update, query).await
}

async fn trigger(state: Arc<AppState>, endpoint: TenderEndpoint, query: SyncQuery) -> Response {
    let range = match DateRange::parse(&query.data_inicial, &query.data_final) {
        Ok(range) => range,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SyncResponse {
                    success: false,
                    message: Some(err.to_string()),
                    ..SyncResponse::default()
                }),
            )
                .into_response();
        }
    };

    match state.runner.run_sync(endpoint, range).await {
        Ok(summary) => match summary.outcome {
            RunOutcome::Completed => Json(SyncResponse {
                success: true,
                status: Some("Concluído com sucesso".to_string()),
                ..SyncResponse::default()
            })
            .into_response(),
            RunOutcome::Interrupted {
                modality,
                next_page,
            } => Json(SyncResponse {
                success: false,
                message: Some(
                    "tempo de execução esgotado; reinvoque para retomar".to_string(),
                ),
                current_page: Some(next_page),
                modalidade: Some(modality),
                ..SyncResponse::default()
            })
            .into_response(),
        },
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SyncResponse {
                success: false,
                message: Some(format!("{err:#}")),
                ..SyncResponse::default()
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct StubRunner {
        outcome: RunOutcome,
    }

    #[async_trait]
    impl SyncRunner for StubRunner {
        async fn run_sync(
            &self,
            endpoint: TenderEndpoint,
            _range: DateRange,
        ) -> anyhow::Result<SyncRunSummary> {
            Ok(SyncRunSummary {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                endpoint,
                pages: 1,
                created: 0,
                updated: 0,
                unchanged: 0,
                rejected: 0,
                notified: 0,
                failed_modalities: vec![],
                outcome: self.outcome,
            })
        }
    }

    fn test_app(outcome: RunOutcome) -> Router {
        app(AppState::new(Arc::new(StubRunner { outcome })))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app(RunOutcome::Completed);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn completed_run_reports_success_status() {
        let app = test_app(RunOutcome::Completed);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync?dataInicial=20250101&dataFinal=20250108")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "Concluído com sucesso");
    }

    #[tokio::test]
    async fn interrupted_run_reports_resume_position() {
        let app = test_app(RunOutcome::Interrupted {
            modality: 6,
            next_page: 42,
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync/delta?dataInicial=20250101&dataFinal=20250108")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["currentPage"], 42);
        assert_eq!(body["modalidade"], 6);
    }

    #[tokio::test]
    async fn malformed_dates_are_a_bad_request() {
        let app = test_app(RunOutcome::Completed);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync?dataInicial=2025-01-01&dataFinal=20250108")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn missing_query_parameters_are_rejected() {
        let app = test_app(RunOutcome::Completed);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
