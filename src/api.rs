// 🌐 REST API - axum router over the ledger
//
// Every JSON body is wrapped in `ApiResponse`. Handlers lock the shared
// connection only after all awaits so the futures stay `Send`.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{multipart::MultipartRejection, DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::ServerConfig;
use crate::db::{self, Event};
use crate::entities::rule::{self as rule_store, NewRule, Rule, RulePatch};
use crate::entities::setting::{self as setting_store, Setting};
use crate::entities::tag::{self as tag_store, NewTag, Tag, TagPatch};
use crate::entities::transaction::{
    NewTransaction, Transaction, TransactionFilter, TransactionKind, TransactionPatch,
};
use crate::error::{LedgerError, Result};
use crate::importer::{self, ImportKind, ImportReport};
use crate::rules::{self, BatchApplication, RuleApplication};
use crate::summary::{self, MonthlySummary, SummaryQuery};

const ACTOR: &str = "api";

// ============================================================================
// STATE & ENVELOPE
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    pub fn new(conn: Connection) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panicked handler leaves SQLite consistent (statements are atomic)
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::Validation(_) | LedgerError::Csv(_) | LedgerError::Spreadsheet(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Database(_) | LedgerError::Json(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(ApiResponse::failure(self.to_string()))).into_response()
    }
}

// Extractor rejections (bad JSON, non-numeric ids, malformed query strings)
// answer inside the envelope like every other validation failure

impl From<JsonRejection> for LedgerError {
    fn from(rejection: JsonRejection) -> Self {
        LedgerError::validation(rejection.body_text())
    }
}

impl From<PathRejection> for LedgerError {
    fn from(rejection: PathRejection) -> Self {
        LedgerError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for LedgerError {
    fn from(rejection: QueryRejection) -> Self {
        LedgerError::validation(rejection.body_text())
    }
}

impl From<MultipartRejection> for LedgerError {
    fn from(rejection: MultipartRejection) -> Self {
        LedgerError::validation(rejection.body_text())
    }
}

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(LedgerError))]
struct JsonBody<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(LedgerError))]
struct PathParam<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(LedgerError))]
struct QueryParams<T>(T);

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, LedgerError>;
type Created<T> = std::result::Result<(StatusCode, Json<ApiResponse<T>>), LedgerError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

fn created<T>(data: T) -> Created<T> {
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(data))))
}

// ============================================================================
// ROUTER
// ============================================================================

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/transactions", get(list_transactions).post(create_transaction))
        .route("/transactions/categories", get(list_categories))
        .route("/transactions/summary", get(transaction_summary))
        .route(
            "/transactions/:id",
            get(get_transaction).patch(update_transaction).delete(delete_transaction),
        )
        .route("/transactions/:id/restore-amount", post(restore_amount))
        .route("/transactions/:id/tags", get(transaction_tags))
        .route(
            "/transactions/:id/tags/:tag_id",
            post(attach_tag).delete(detach_tag),
        )
        .route("/transactions/:id/events", get(transaction_events))
        .route("/tags", get(list_tags).post(create_tag))
        .route("/tags/:id", get(get_tag).patch(update_tag).delete(delete_tag))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/reorder", post(reorder_rules))
        .route("/rules/apply-all", post(apply_all_rules))
        .route("/rules/:id", get(get_rule).patch(update_rule).delete(delete_rule))
        .route("/rules/:id/toggle", patch(toggle_rule))
        .route("/rules/:id/apply", post(apply_rule))
        .route("/rules/:id/apply/:transaction_id", post(apply_rule_to_transaction))
        .route("/settings", get(list_settings).post(save_setting))
        .route("/settings/:key", get(get_setting).delete(delete_setting))
        .route("/import/statement", post(import_statement))
        .route("/import/invoice", post(import_invoice))
}

/// Full application router: banner, `/api` routes, body limit, CORS and tracing
pub fn build_router(state: AppState, config: &ServerConfig) -> Result<Router> {
    let cors = if config.allows_any_origin() {
        CorsLayer::permissive()
    } else {
        let origin = HeaderValue::from_str(config.cors_origin.trim()).map_err(|_| {
            LedgerError::validation(format!("Invalid CORS origin '{}'", config.cors_origin))
        })?;
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Ok(Router::new()
        .route("/", get(banner))
        .nest("/api", api_routes())
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

// ============================================================================
// QUERY PARAMETERS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TransactionQuery {
    month: Option<u32>,
    year: Option<i32>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    category: Option<String>,
    kind: Option<String>,

    /// Comma-separated tag ids
    tags: Option<String>,
}

fn parse_tag_ids(raw: Option<&str>) -> Result<Vec<i64>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| LedgerError::validation(format!("Invalid tag id '{}'", s)))
        })
        .collect()
}

impl TransactionQuery {
    fn to_filter(&self) -> Result<TransactionFilter> {
        let kind = self.kind.as_deref().map(TransactionKind::parse).transpose()?;
        let filter = TransactionFilter {
            month: self.month,
            year: self.year,
            start: self.start,
            end: self.end,
            category: self.category.clone().filter(|c| !c.trim().is_empty()),
            kind,
            tag_ids: parse_tag_ids(self.tags.as_deref())?,
        };
        // Surface bad month/year/range as 400 before touching the database
        filter.date_range()?;
        Ok(filter)
    }

    fn to_summary(&self) -> Result<SummaryQuery> {
        Ok(SummaryQuery {
            month: self.month,
            year: self.year,
            start: self.start,
            end: self.end,
            tag_ids: parse_tag_ids(self.tags.as_deref())?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RuleListQuery {
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    rule_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct SettingRequest {
    key: String,
    value: String,
}

// ============================================================================
// GENERAL
// ============================================================================

/// GET / - Service banner
async fn banner() -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::ok(serde_json::json!({
        "service": "pocket-ledger",
        "version": crate::VERSION,
        "api": "/api",
    })))
}

/// GET /api/health - Health check
async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::ok("OK"))
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// POST /api/transactions
async fn create_transaction(
    State(state): State<AppState>,
    JsonBody(new): JsonBody<NewTransaction>,
) -> Created<Transaction> {
    new.validate_entry()?;
    let conn = state.conn();
    created(db::insert_transaction(&conn, &new, ACTOR)?)
}

/// GET /api/transactions?month&year&start&end&category&kind&tags
async fn list_transactions(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<TransactionQuery>,
) -> ApiResult<Vec<Transaction>> {
    let filter = params.to_filter()?;
    let conn = state.conn();
    let basis = setting_store::date_basis(&conn)?;
    ok(db::list_transactions(&conn, &filter, basis)?)
}

/// GET /api/transactions/categories
async fn list_categories(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    let conn = state.conn();
    ok(db::list_categories(&conn)?)
}

/// GET /api/transactions/summary
async fn transaction_summary(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<TransactionQuery>,
) -> ApiResult<MonthlySummary> {
    let query = params.to_summary()?;
    let conn = state.conn();
    ok(summary::monthly_summary(&conn, &query)?)
}

/// GET /api/transactions/:id
async fn get_transaction(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Transaction> {
    let conn = state.conn();
    ok(db::get_transaction(&conn, id)?)
}

/// PATCH /api/transactions/:id
async fn update_transaction(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<TransactionPatch>,
) -> ApiResult<Transaction> {
    let conn = state.conn();
    ok(db::patch_transaction(&conn, id, &patch, ACTOR)?)
}

/// DELETE /api/transactions/:id
async fn delete_transaction(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    db::delete_transaction(&conn, id, ACTOR)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/transactions/:id/restore-amount
async fn restore_amount(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Transaction> {
    let conn = state.conn();
    ok(db::restore_original_amount(&conn, id, ACTOR)?)
}

/// GET /api/transactions/:id/tags
async fn transaction_tags(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Vec<Tag>> {
    let conn = state.conn();
    ok(tag_store::list_transaction_tags(&conn, id)?)
}

/// POST /api/transactions/:id/tags/:tag_id
async fn attach_tag(
    State(state): State<AppState>,
    PathParam((id, tag_id)): PathParam<(i64, i64)>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    tag_store::add_transaction_tag(&conn, id, tag_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/transactions/:id/tags/:tag_id
async fn detach_tag(
    State(state): State<AppState>,
    PathParam((id, tag_id)): PathParam<(i64, i64)>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    tag_store::remove_transaction_tag(&conn, id, tag_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/transactions/:id/events - Audit trail
async fn transaction_events(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Vec<Event>> {
    let conn = state.conn();
    ok(db::get_events_for_entity(&conn, "transaction", &id.to_string())?)
}

// ============================================================================
// TAGS
// ============================================================================

async fn list_tags(State(state): State<AppState>) -> ApiResult<Vec<Tag>> {
    let conn = state.conn();
    ok(tag_store::list_tags(&conn)?)
}

async fn create_tag(State(state): State<AppState>, JsonBody(new): JsonBody<NewTag>) -> Created<Tag> {
    let conn = state.conn();
    created(tag_store::insert_tag(&conn, &new)?)
}

async fn get_tag(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Tag> {
    let conn = state.conn();
    ok(tag_store::get_tag(&conn, id)?)
}

async fn update_tag(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<TagPatch>,
) -> ApiResult<Tag> {
    let conn = state.conn();
    ok(tag_store::update_tag(&conn, id, &patch)?)
}

async fn delete_tag(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    tag_store::delete_tag(&conn, id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// RULES
// ============================================================================

async fn list_rules(State(state): State<AppState>, QueryParams(params): QueryParams<RuleListQuery>) -> ApiResult<Vec<Rule>> {
    let conn = state.conn();
    ok(rule_store::list_rules(&conn, params.active_only)?)
}

async fn create_rule(State(state): State<AppState>, JsonBody(new): JsonBody<NewRule>) -> Created<Rule> {
    let conn = state.conn();
    created(rule_store::insert_rule(&conn, &new)?)
}

async fn get_rule(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Rule> {
    let conn = state.conn();
    ok(rule_store::get_rule(&conn, id)?)
}

async fn update_rule(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<RulePatch>,
) -> ApiResult<Rule> {
    let conn = state.conn();
    ok(rule_store::update_rule(&conn, id, &patch)?)
}

async fn delete_rule(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    rule_store::delete_rule(&conn, id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/rules/:id/toggle - Flip active flag
async fn toggle_rule(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<Rule> {
    let conn = state.conn();
    ok(rule_store::toggle_rule(&conn, id)?)
}

/// POST /api/rules/reorder - First id gets the highest priority
async fn reorder_rules(State(state): State<AppState>, JsonBody(body): JsonBody<ReorderRequest>) -> ApiResult<Vec<Rule>> {
    let conn = state.conn();
    ok(rule_store::reorder_rules(&conn, &body.rule_ids)?)
}

/// POST /api/rules/apply-all - Active rules over the filtered transactions
async fn apply_all_rules(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<TransactionQuery>,
) -> ApiResult<BatchApplication> {
    let filter = params.to_filter()?;
    let conn = state.conn();
    ok(rules::apply_all_rules(&conn, &filter, ACTOR)?)
}

/// POST /api/rules/:id/apply - One rule over every transaction
async fn apply_rule(State(state): State<AppState>, PathParam(id): PathParam<i64>) -> ApiResult<RuleApplication> {
    let conn = state.conn();
    ok(rules::apply_rule_to_all(&conn, id, ACTOR)?)
}

/// POST /api/rules/:id/apply/:transaction_id
async fn apply_rule_to_transaction(
    State(state): State<AppState>,
    PathParam((id, transaction_id)): PathParam<(i64, i64)>,
) -> ApiResult<RuleApplication> {
    let conn = state.conn();
    ok(rules::apply_rule_to_transaction(&conn, id, transaction_id, ACTOR)?)
}

// ============================================================================
// SETTINGS
// ============================================================================

async fn list_settings(State(state): State<AppState>) -> ApiResult<BTreeMap<String, String>> {
    let conn = state.conn();
    ok(setting_store::list_settings(&conn)?)
}

async fn save_setting(State(state): State<AppState>, JsonBody(body): JsonBody<SettingRequest>) -> Created<Setting> {
    let conn = state.conn();
    created(setting_store::put_setting(&conn, &body.key, &body.value)?)
}

async fn get_setting(State(state): State<AppState>, PathParam(key): PathParam<String>) -> ApiResult<Setting> {
    let conn = state.conn();
    let setting = setting_store::get_setting(&conn, &key)?
        .ok_or_else(|| LedgerError::not_found("Setting", &key))?;
    ok(setting)
}

async fn delete_setting(
    State(state): State<AppState>,
    PathParam(key): PathParam<String>,
) -> std::result::Result<StatusCode, LedgerError> {
    let conn = state.conn();
    setting_store::delete_setting(&conn, &key)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// IMPORT
// ============================================================================

/// Pull the `file` field out of a multipart upload
async fn read_upload(mut multipart: Multipart) -> Result<(String, Vec<u8>)> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        LedgerError::validation(format!("Invalid upload: {}", e))
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| LedgerError::validation("Uploaded file has no name"))?;
        let bytes = field.bytes().await.map_err(invalid)?;
        return Ok((file_name, bytes.to_vec()));
    }

    Err(LedgerError::validation("Multipart field 'file' is required"))
}

async fn import_upload(state: AppState, multipart: Multipart, kind: ImportKind) -> Created<ImportReport> {
    let (file_name, bytes) = read_upload(multipart).await?;
    let conn = state.conn();
    created(importer::import_file(&conn, &file_name, &bytes, kind)?)
}

/// POST /api/import/statement - Bank statement (CSV/Excel)
async fn import_statement(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Created<ImportReport> {
    import_upload(state, multipart?, ImportKind::Statement).await
}

/// POST /api/import/invoice - Credit-card invoice (CSV/Excel)
async fn import_invoice(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Created<ImportReport> {
    import_upload(state, multipart?, ImportKind::Invoice).await
}

// ============================================================================
// TESTS
// ============================================================================
