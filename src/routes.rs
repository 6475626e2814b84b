use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{AuthError, AuthKeys, OwnerSession};
use crate::db::{Database, Entry, EntryFilter, OwnerScope, Source, SourceSpec};
use crate::registry::SubscriptionRegistry;
use crate::sync::{SyncOrchestrator, SyncReport};
use crate::translate::{TranslateError, TranslationService};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub db: Arc<Database>,
    pub registry: Arc<SubscriptionRegistry>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub translations: Arc<TranslationService>,
    pub auth: Arc<AuthKeys>,
    /// Give a user the seed sources on their first sync
    pub seed_new_users: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sync", post(sync))
        .route("/api/sync/shared", post(sync_shared))
        .route("/api/translate", post(translate))
        .route("/api/proxy", post(proxy))
        .route("/api/sources", get(list_sources).post(add_source))
        .route("/api/sources/:id", patch(update_source).delete(delete_source))
        .route("/api/articles", get(list_articles))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body: `{"success": false, "error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", err))
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::Missing | AuthError::Invalid => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
        };
        Self::new(status, err.to_string())
    }
}

impl From<TranslateError> for ApiError {
    fn from(err: TranslateError) -> Self {
        let status = match err {
            TranslateError::NotFound => StatusCode::NOT_FOUND,
            TranslateError::Unconfigured => StatusCode::SERVICE_UNAVAILABLE,
            TranslateError::Upstream(_) | TranslateError::EmptyResponse => StatusCode::BAD_GATEWAY,
            TranslateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub new_articles_count: usize,
    pub feeds_processed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl From<SyncReport> for SyncResponse {
    fn from(report: SyncReport) -> Self {
        Self {
            success: true,
            new_articles_count: report.new_count,
            feeds_processed: report.sources_processed,
            errors: report.errors.iter().map(ToString::to_string).collect(),
        }
    }
}

pub async fn sync(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
) -> Result<Json<SyncResponse>, ApiError> {
    let scope = session.scope();
    if state.seed_new_users && state.registry.seed_if_empty(&scope).await? {
        info!(owner = %scope, "Seeded sources for new user");
    }

    let report = state.orchestrator.run_sync(&scope).await?;
    Ok(Json(report.into()))
}

pub async fn sync_shared(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
) -> Result<Json<SyncResponse>, ApiError> {
    session.require_system()?;
    let report = state.orchestrator.run_sync(&OwnerScope::Shared).await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub article_id: i64,
}

pub async fn translate(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Json(request): Json<TranslateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let translated = state
        .translations
        .translate_entry(&session.scope(), request.article_id)
        .await?;
    Ok(Json(json!({ "success": true, "translated": translated })))
}

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub url: Option<String>,
}

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    _session: OwnerSession,
    Json(request): Json<ProxyRequest>,
) -> Result<Response, ApiError> {
    let url = request
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let response = match state
        .orchestrator
        .fetcher()
        .passthrough(url.trim(), PROXY_TIMEOUT)
        .await
    {
        Ok(raw) => Json(json!({ "success": true, "data": raw.body, "status": raw.status }))
            .into_response(),
        Err(e) => {
            error!(url = %url, error = %e, "Proxy fetch failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ListSourcesQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Query(query): Query<ListSourcesQuery>,
) -> Result<Json<Vec<Source>>, ApiError> {
    let sources = state
        .registry
        .list_visible(&session.scope(), !query.all)
        .await?;
    Ok(Json(sources))
}

#[derive(Debug, Deserialize)]
pub struct AddSourceRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

pub async fn add_source(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Json(request): Json<AddSourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = request.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::bad_request("Feed URL must be http or https"));
    }
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Name is required"));
    }

    let mut spec = SourceSpec::new(request.name.trim(), url);
    if let Some(handle) = request.handle.filter(|h| !h.trim().is_empty()) {
        spec = spec.with_handle(handle.trim());
    }
    if let Some(avatar) = request.avatar_url {
        spec = spec.with_avatar(avatar);
    }

    let source = state.registry.add(&session.scope(), &spec).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSourceRequest {
    pub active: bool,
}

pub async fn update_source(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Path(source_id): Path<i64>,
    Json(request): Json<UpdateSourceRequest>,
) -> Result<Json<Source>, ApiError> {
    let scope = session.scope();
    if !state
        .registry
        .set_active(&scope, source_id, request.active)
        .await?
    {
        return Err(ApiError::not_found("Source not found"));
    }

    let source = state
        .db
        .get_source(&scope, source_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Source not found"))?;
    Ok(Json(source))
}

pub async fn delete_source(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Path(source_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.registry.remove(&session.scope(), source_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Source not found"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ArticlesQuery {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

impl ArticlesQuery {
    fn entry_filter(&self) -> Result<EntryFilter, ApiError> {
        match self.filter.as_deref() {
            None | Some("all") => Ok(EntryFilter::All),
            Some("unread") => Ok(EntryFilter::Unread),
            Some("favorite") => Ok(EntryFilter::Favorite),
            Some(other) => Err(ApiError::bad_request(format!("Unknown filter '{}'", other))),
        }
    }

    fn page_size(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
pub struct ArticleView {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub content_raw: String,
    pub content_translated: Option<String>,
    pub url: String,
    pub published_at: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
}

impl From<Entry> for ArticleView {
    fn from(entry: Entry) -> Self {
        Self {
            published_at: entry.published().map(|p| p.to_rfc3339()),
            id: entry.id,
            source_id: entry.source_id,
            title: entry.title,
            content_raw: entry.content_raw,
            content_translated: entry.content_translated,
            url: entry.url,
            is_read: entry.is_read,
            is_favorite: entry.is_favorite,
        }
    }
}

pub async fn list_articles(
    State(state): State<Arc<AppState>>,
    session: OwnerSession,
    Query(query): Query<ArticlesQuery>,
) -> Result<Json<Vec<ArticleView>>, ApiError> {
    let filter = query.entry_filter()?;
    let entries = state
        .db
        .list_entries(&session.scope(), filter, query.page_size(), query.offset.max(0))
        .await?;
    Ok(Json(entries.into_iter().map(ArticleView::from).collect()))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
