// REST API - ledger, bank lines, reconciliation and audit over HTTP

use crate::config::Config;
use crate::db::{self, BankLine, NewTransaction};
use crate::error::LedgerError;
use crate::reconciliation::ReconciliationEngine;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared application state.
/// The mutex is the in-process lock around every "read last hash, append" step.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(conn: Connection, config: Config) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError(LedgerError::Internal("database lock poisoned".to_string())))
    }
}

/// API Response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Library error carried to an HTTP status
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            LedgerError::InvalidThreshold(_) | LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Integrity(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (status, Json(ApiResponse::err(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Request / Response Bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

impl TransactionRequest {
    fn to_new_transaction(&self, base_currency: &str) -> NewTransaction {
        NewTransaction {
            date: self.date,
            description: self.description.clone(),
            amount: self.amount,
            currency: self.currency.clone().unwrap_or_else(|| base_currency.to_string()),
            category: self.category.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BankLineRequest {
    pub external_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub received: usize,
    pub inserted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rate_to_base: f64,
    #[serde(default)]
    pub actor_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RateResponse {
    pub currency: String,
    pub rate_to_base: f64,
}

#[derive(Debug, Serialize)]
pub struct RatesResponse {
    pub base_currency: String,
    pub rates: Vec<RateResponse>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub intact: bool,
    pub entries: usize,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/transactions - All ledger transactions
async fn list_transactions(State(state): State<AppState>) -> ApiResult<Vec<db::LedgerTransaction>> {
    let conn = state.conn()?;
    let txs = db::get_all_ledger_transactions(&conn)?;
    Ok(Json(ApiResponse::ok(txs)))
}

/// POST /api/transactions - Record a ledger transaction
async fn create_transaction(
    State(state): State<AppState>,
    Json(req): Json<TransactionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<db::LedgerTransaction>>), ApiError> {
    let input = req.to_new_transaction(&state.config.base_currency);
    let mut conn = state.conn()?;
    let tx = db::insert_ledger_transaction(&mut conn, &input, &state.config.base_currency, req.actor_id.as_deref())?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(tx))))
}

/// PUT /api/transactions/:id - Edit a ledger transaction
async fn update_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TransactionRequest>,
) -> ApiResult<db::LedgerTransaction> {
    let input = req.to_new_transaction(&state.config.base_currency);
    let mut conn = state.conn()?;
    let tx = db::update_ledger_transaction(
        &mut conn,
        id,
        &input,
        &state.config.base_currency,
        req.actor_id.as_deref(),
    )?;
    Ok(Json(ApiResponse::ok(tx)))
}

/// POST /api/bank-lines - Import statement lines (already imported ids are skipped)
async fn import_bank_lines(
    State(state): State<AppState>,
    Json(lines): Json<Vec<BankLineRequest>>,
) -> ApiResult<ImportResponse> {
    let lines: Vec<BankLine> = lines
        .into_iter()
        .map(|l| BankLine {
            external_id: l.external_id,
            date: l.date,
            description: l.description,
            amount: l.amount,
            currency: l.currency.unwrap_or_else(|| state.config.base_currency.clone()),
        })
        .collect();

    let mut conn = state.conn()?;
    let inserted = db::import_bank_lines(&mut conn, &lines)?;
    Ok(Json(ApiResponse::ok(ImportResponse {
        received: lines.len(),
        inserted,
    })))
}

/// GET /api/rates - Stored exchange rates against the base currency
async fn list_rates(State(state): State<AppState>) -> ApiResult<RatesResponse> {
    let conn = state.conn()?;
    let rates = db::load_exchange_rates(&conn, &state.config.base_currency)?;
    Ok(Json(ApiResponse::ok(RatesResponse {
        base_currency: rates.base_currency().to_string(),
        rates: rates
            .rates()
            .into_iter()
            .map(|(currency, rate_to_base)| RateResponse { currency, rate_to_base })
            .collect(),
    })))
}

/// PUT /api/rates/:currency - Set one exchange rate
async fn set_rate(
    State(state): State<AppState>,
    Path(currency): Path<String>,
    Json(req): Json<RateRequest>,
) -> ApiResult<RateResponse> {
    let mut conn = state.conn()?;
    db::set_exchange_rate(
        &mut conn,
        &state.config.base_currency,
        &currency,
        req.rate_to_base,
        req.actor_id.as_deref(),
    )?;
    Ok(Json(ApiResponse::ok(RateResponse {
        currency: currency.to_ascii_uppercase(),
        rate_to_base: req.rate_to_base,
    })))
}

/// POST /api/reconcile - Match pending bank lines against unbacked transactions
async fn reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> ApiResult<crate::reconciliation::ReconciliationReport> {
    let threshold = req.threshold.unwrap_or(state.config.match_threshold);
    let engine = ReconciliationEngine::with_epsilon(state.config.amount_epsilon);

    let mut conn = state.conn()?;
    let bank = db::pending_bank_lines(&conn)?;
    let ledger = db::unbacked_ledger_transactions(&conn)?;
    let report = engine.reconcile(&bank, &ledger, threshold)?;

    if !req.dry_run {
        db::apply_reconciliation(&mut conn, &report, req.actor_id.as_deref())?;
    }
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/audit/verify - Recompute the whole audit chain
async fn verify_audit(State(state): State<AppState>) -> ApiResult<VerifyResponse> {
    let conn = state.conn()?;
    let entries = db::verify_audit_log(&conn)?;
    Ok(Json(ApiResponse::ok(VerifyResponse { intact: true, entries })))
}

/// GET /api/audit/:entity_type/:entity_id - History of one entity, newest first
async fn audit_history(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> ApiResult<Vec<crate::audit::AuditEntry>> {
    let conn = state.conn()?;
    let entries = db::get_audit_log(&conn, &entity_type, &entity_id)?;
    Ok(Json(ApiResponse::ok(entries)))
}

/// All routes, mounted under /api
pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/transactions", get(list_transactions).post(create_transaction))
        .route("/transactions/:id", put(update_transaction))
        .route("/bank-lines", post(import_bank_lines))
        .route("/rates", get(list_rates))
        .route("/rates/:currency", put(set_rate))
        .route("/reconcile", post(reconcile))
        .route("/audit/verify", get(verify_audit))
        .route("/audit/:entity_type/:entity_id", get(audit_history))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}
