//! HTTP API layer exposing the records hub operations.

pub mod download;
pub mod error;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{self, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::Engine as _;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use records_hub_core::auth::TokenVerifier;
use records_hub_core::blob::BlobStore;
use records_hub_core::engine::{
    DownloadEntry, ItemOutcome, MutationEngine, SharedItem, Upload,
};
use records_hub_core::events::Event;
use records_hub_core::model::{Breadcrumb, HistoryEntry, Item, ItemId, Role, ShareGrant};
use records_hub_core::sharing::SharedGroup;
use records_hub_core::{Actor, Error};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use self::error::{status_for, ApiError};

pub type ApiResult<T> = Result<T, ApiError>;

/// Caller identity extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub actor: Actor,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(auth) = header_str(headers, "Authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return match state.verifier.verify(token).await {
                    Some(claims) => Ok(Self {
                        actor: claims.into_actor(),
                    }),
                    None => Err(StatusCode::UNAUTHORIZED),
                };
            }
        }
        let user_id = header_str(headers, "X-User-Id").ok_or(StatusCode::UNAUTHORIZED)?;
        let role = header_str(headers, "X-User-Type")
            .and_then(Role::parse)
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let actor = match role {
            Role::Patient => Actor::patient(user_id),
            Role::Doctor => Actor::doctor(user_id),
            Role::Receptionist => Actor::receptionist(
                user_id,
                header_str(headers, "X-Assigned-Doctor-Id").map(str::to_string),
            ),
        };
        Ok(Self { actor })
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MutationEngine>,
    pub blobs: Arc<dyn BlobStore>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Deserialize)]
struct ListParams {
    parent_id: Option<Uuid>,
    #[serde(default)]
    shared_with_me: bool,
}

#[derive(Deserialize)]
struct FolderRequest {
    name: String,
    parent_id: Option<Uuid>,
    category: Option<String>,
}

#[derive(Deserialize)]
struct FileRequest {
    name: String,
    parent_id: Option<Uuid>,
    /// Base64 encoded file contents.
    content: String,
    extension: Option<String>,
    category: Option<String>,
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
    expected_revision: Option<u64>,
}

#[derive(Deserialize)]
struct MoveRequest {
    parent_id: Option<Uuid>,
    expected_revision: Option<u64>,
}

#[derive(Deserialize)]
struct RevisionParams {
    expected_revision: Option<u64>,
}

#[derive(Deserialize)]
struct BulkRequest {
    item_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
struct ShareRequest {
    item_ids: Vec<Uuid>,
    recipient_id: String,
    recipient_type: Option<Role>,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: Vec<ItemId>,
}

/// One entry of a bulk response.
#[derive(Serialize)]
pub struct BulkResult {
    pub item_id: ItemId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl<T: Serialize> From<ItemOutcome<T>> for BulkResult {
    fn from(outcome: ItemOutcome<T>) -> Self {
        match outcome.result {
            Ok(value) => Self {
                item_id: outcome.item_id,
                ok: true,
                error: None,
                message: None,
                value: serde_json::to_value(value).ok(),
            },
            Err(err) => Self {
                item_id: outcome.item_id,
                ok: false,
                error: Some(err.kind()),
                message: Some(err.to_string()),
                value: None,
            },
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/items", get(list_items))
        .route("/items/delete", post(delete_items))
        .route("/items/share", post(share_items))
        .route("/items/{id}", get(get_item).delete(delete_item))
        .route("/items/{id}/breadcrumbs", get(breadcrumbs))
        .route("/items/{id}/rename", put(rename_item))
        .route("/items/{id}/move", put(move_item))
        .route("/items/{id}/history", get(item_history))
        .route("/items/{id}/download", get(download_item))
        .route("/folders", post(create_folder))
        .route("/files", post(upload_file))
        .route("/grants/{id}", delete(revoke_grant))
        .route("/shared-with-me", get(shared_with_me))
        .route("/shared-by-me", get(shared_by_me))
        .route("/download", post(download_items))
        .route("/events", get(event_stream))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn list_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Item>>> {
    if params.shared_with_me && params.parent_id.is_none() {
        let mut roots: Vec<Item> = state
            .engine
            .shared_with_me(&auth.actor)
            .into_iter()
            .flat_map(|g| g.roots)
            .collect();
        records_hub_core::storage::sort_for_display(&mut roots);
        return Ok(Json(roots));
    }
    Ok(Json(state.engine.list_items(&auth.actor, params.parent_id)?))
}

async fn get_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Item>> {
    Ok(Json(state.engine.get(&auth.actor, id)?))
}

async fn breadcrumbs(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Breadcrumb>>> {
    Ok(Json(state.engine.breadcrumbs(&auth.actor, id)?))
}

async fn create_folder(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<FolderRequest>,
) -> ApiResult<(StatusCode, Json<Item>)> {
    let item = state
        .engine
        .create_folder(&auth.actor, &req.name, req.parent_id, req.category)?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn upload_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<FileRequest>,
) -> ApiResult<(StatusCode, Json<Item>)> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(req.content.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("content is not valid base64: {e}")))?;
    let file_ref = state.blobs.put(&data).map_err(ApiError::Blob)?;
    let upload = Upload {
        name: req.name,
        parent_id: req.parent_id,
        file_ref: file_ref.clone(),
        size: data.len() as u64,
        extension: req.extension,
        category: req.category,
    };
    match state.engine.upload(&auth.actor, upload) {
        Ok(item) => Ok((StatusCode::CREATED, Json(item))),
        Err(err) => {
            if let Err(cleanup) = state.blobs.remove(&file_ref) {
                tracing::warn!(%file_ref, error = %cleanup, "orphaned blob after rejected upload");
            }
            Err(err.into())
        }
    }
}

async fn rename_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<Item>> {
    Ok(Json(state.engine.rename(
        &auth.actor,
        id,
        &req.name,
        req.expected_revision,
    )?))
}

async fn move_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<Json<Item>> {
    Ok(Json(state.engine.move_item(
        &auth.actor,
        id,
        req.parent_id,
        req.expected_revision,
    )?))
}

async fn delete_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Query(params): Query<RevisionParams>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = state
        .engine
        .delete(&auth.actor, id, params.expected_revision)?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn delete_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Json<Vec<BulkResult>> {
    let outcomes = state.engine.delete_many(&auth.actor, &req.item_ids);
    Json(outcomes.into_iter().map(BulkResult::from).collect())
}

async fn share_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ShareRequest>,
) -> Json<Vec<BulkResult>> {
    let outcomes = state.engine.share_many(
        &auth.actor,
        &req.item_ids,
        &req.recipient_id,
        req.recipient_type,
    );
    Json(outcomes.into_iter().map(BulkResult::from).collect())
}

async fn revoke_grant(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ShareGrant>> {
    Ok(Json(state.engine.revoke(&auth.actor, id)?))
}

async fn shared_with_me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Json<Vec<SharedGroup>> {
    Json(state.engine.shared_with_me(&auth.actor))
}

async fn shared_by_me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Json<Vec<SharedItem>> {
    Json(state.engine.shared_by_me(&auth.actor))
}

async fn item_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    Ok(Json(state.engine.history(&auth.actor, id)?))
}

fn attachment(content_type: &'static str, filename: &str, body: Bytes) -> Response {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        filename.replace(['"', '\\'], "_")
    );
    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        body,
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn archive_response(state: &AppState, name: &str, entries: &[DownloadEntry]) -> ApiResult<Response> {
    let bytes = download::build_archive(state.blobs.as_ref(), entries).map_err(ApiError::Blob)?;
    Ok(attachment("application/zip", &format!("{name}.zip"), Bytes::from(bytes)))
}

/// A single file is streamed as is; a folder is packed into an archive.
async fn download_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let item = state.engine.get(&auth.actor, id)?;
    let plan = state.engine.download_plan(&auth.actor, id)?;
    if item.is_folder() {
        return archive_response(&state, &item.name, &plan);
    }
    let Some(entry) = plan.first() else {
        return Err(Error::NotFound(id).into());
    };
    let bytes = state.blobs.fetch(&entry.file_ref).map_err(ApiError::Blob)?;
    Ok(attachment(
        "application/octet-stream",
        &item.name,
        Bytes::from(bytes),
    ))
}

/// Archive of several items. Items the caller cannot download are skipped
/// and counted in `X-Skipped-Items`; if none can be downloaded the first
/// failure is returned.
async fn download_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> ApiResult<Response> {
    let outcomes = state.engine.download_many(&auth.actor, &req.item_ids);
    let mut entries = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(plan) => entries.extend(plan),
            Err(err) => failures.push(err),
        }
    }
    if failures.len() == req.item_ids.len() {
        return Err(match failures.into_iter().next() {
            Some(err) => err.into(),
            None => ApiError::BadRequest("no items requested".into()),
        });
    }
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let mut response = archive_response(&state, &format!("records-{stamp}"), &entries)?;
    response
        .headers_mut()
        .insert("X-Skipped-Items", HeaderValue::from(failures.len()));
    for err in &failures {
        tracing::debug!(kind = err.kind(), status = %status_for(err), "download item skipped");
    }
    Ok(response)
}

fn event_item(event: &Event) -> Uuid {
    match event {
        Event::Created { id, .. }
        | Event::Renamed { id, .. }
        | Event::Moved { id, .. }
        | Event::Deleted { id, .. }
        | Event::Shared { id, .. }
        | Event::Revoked { id, .. } => *id,
    }
}

/// Server-sent stream of changes to items the caller can see.
async fn event_stream(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let rx = state.engine.events().subscribe();
    let engine = state.engine.clone();
    let actor = auth.actor;
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
        let engine = engine.clone();
        let actor = actor.clone();
        async move {
            let event = res.ok()?;
            if !engine.observes(&actor, event_item(&event)) {
                return None;
            }
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(sse::Event::default().data(data)))
        }
    });
    Sse::new(stream)
}
