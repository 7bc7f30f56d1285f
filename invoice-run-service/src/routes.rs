//! HTTP surface for the run workflow, the invoice lock and the raw-cost
//! import boundary.

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::models::{BillingMonth, ImportCostRow};
use crate::services::metrics::record_imported_rows;
use crate::services::run::CreateRun;
use crate::services::{Database, RunOrchestrator};

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<Database>,
    pub orchestrator: Arc<RunOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub billing_month: String,
    pub target_customer_id: Option<Uuid>,
    pub ingestion_batch_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportCostsRequest {
    pub billing_month: String,
    #[validate(length(min = 1))]
    pub source: String,
    #[validate(length(min = 1), nested)]
    pub rows: Vec<ImportCostRow>,
}

fn parse_month(raw: &str) -> Result<BillingMonth, AppError> {
    raw.parse()
        .map_err(|e: crate::models::BillingMonthParseError| AppError::BadRequest(anyhow!(e)))
}

/// `POST /invoice-runs`: create or idempotently return a run.
async fn create_run(
    State(state): State<ApiState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, AppError> {
    let month = parse_month(&request.billing_month)?;

    let creation = state
        .orchestrator
        .create_run(CreateRun {
            month,
            target_customer_id: request.target_customer_id,
            ingestion_batch_id: request.ingestion_batch_id,
        })
        .await?;

    let status = if creation.idempotent {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((status, Json(creation)))
}

/// `POST /invoice-runs/{run_id}/execute`: run the pipeline. Only valid for
/// a queued run.
async fn execute_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.orchestrator.execute_run(run_id).await?;
    Ok(Json(report))
}

/// `GET /invoice-runs/{run_id}`
async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.orchestrator.get_run(run_id).await?;
    Ok(Json(run))
}

/// `POST /invoices/{invoice_id}/lock`: one-way freeze. 409 if already
/// locked.
async fn lock_invoice(
    State(state): State<ApiState>,
    Path(invoice_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = headers
        .get("x-actor")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    let invoice = state.orchestrator.lock_invoice(invoice_id, actor).await?;
    Ok(Json(invoice))
}

/// `POST /cost-imports`: idempotent raw cost import.
async fn import_costs(
    State(state): State<ApiState>,
    Json(request): Json<ImportCostsRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    let month = parse_month(&request.billing_month)?;

    let batch = state
        .db
        .import_costs(month, &request.source, request.rows)
        .await?;

    record_imported_rows("inserted", batch.row_count as u64);
    record_imported_rows("duplicate", batch.duplicate_count as u64);

    Ok((StatusCode::CREATED, Json(batch)))
}

/// Build the API router.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/invoice-runs", post(create_run))
        .route("/invoice-runs/:run_id", get(get_run))
        .route("/invoice-runs/:run_id/execute", post(execute_run))
        .route("/invoices/:invoice_id/lock", post(lock_invoice))
        .route("/cost-imports", post(import_costs))
        .with_state(state)
}
