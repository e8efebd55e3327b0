//! Import workflow API handlers
//!
//! POST /import/upload, GET /import/session, GET /import/progress,
//! POST /import/decisions, POST /import/commit, POST /import/cancel,
//! GET /import/errors (CSV)

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    DecisionPayload, ImportError, ImportProgress, ImportSession, ImportState, ImportSummary, MatchCandidate,
    ParsedIndividual, ParsedRelationship, Resolution, SkippedRelationship,
};
use crate::services::{csv_file_name, errors_to_csv, IngestError};
use crate::AppState;

/// POST /import/upload query string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    #[serde(alias = "file_name")]
    pub file_name: String,
}

/// POST /import/upload response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub upload_id: Uuid,
    pub state: ImportState,
    pub created_at: DateTime<Utc>,
}

/// POST /import/decisions request
#[derive(Debug, Deserialize)]
pub struct DecisionsRequest {
    pub decisions: Vec<DecisionPayload>,
}

/// GET /import/progress response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub upload_id: Uuid,
    pub state: ImportState,
    pub progress: ImportProgress,
}

/// One row of the preview
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntry {
    pub individual: ParsedIndividual,
    pub candidate: Option<MatchCandidate>,
    /// Explicit decision, or the default when none is needed
    pub decision: Option<Resolution>,
    /// True when the operator chose `decision`
    pub explicit: bool,
}

/// Session snapshot returned by the session, decisions and cancel endpoints
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub upload_id: Uuid,
    pub file_name: String,
    pub state: ImportState,
    pub progress: ImportProgress,
    pub individuals: Vec<PreviewEntry>,
    pub relationships: Vec<ParsedRelationship>,
    /// sourceIds with a candidate and no decision yet
    pub pending_decisions: Vec<String>,
    pub errors: Vec<ImportError>,
    pub skipped_relationships: Vec<SkippedRelationship>,
    pub summary: Option<ImportSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ImportSession> for SessionSnapshot {
    fn from(session: ImportSession) -> Self {
        let individuals = session
            .individuals
            .iter()
            .map(|individual| PreviewEntry {
                individual: individual.clone(),
                candidate: session.candidates.get(&individual.source_id).cloned(),
                decision: session.effective_resolution(&individual.source_id),
                explicit: session.decisions.contains_key(&individual.source_id),
            })
            .collect();
        let pending_decisions = session
            .pending_decisions()
            .into_iter()
            .map(str::to_string)
            .collect();

        Self {
            upload_id: session.upload_id,
            file_name: session.file_name,
            state: session.state,
            progress: session.progress,
            individuals,
            relationships: session.relationships,
            pending_decisions,
            errors: session.errors,
            skipped_relationships: session.skipped_relationships,
            summary: session.summary,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// POST /import/upload?fileName=tree.ged
///
/// Raw GEDCOM bytes in the body. Returns 202 Accepted with the upload ID;
/// parsing continues in the background.
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<impl IntoResponse> {
    let file_name = query.file_name.trim();
    if !has_gedcom_extension(file_name) {
        return Err(ApiError::BadRequest(format!(
            "Only .ged files can be imported: {}",
            file_name
        )));
    }

    let limit = state.settings.max_upload_bytes;
    let body = match body {
        Ok(body) if body.len() as u64 > limit => {
            return Err(ApiError::PayloadTooLarge(format!(
                "{} is {} bytes; the limit is {} bytes",
                file_name,
                body.len(),
                limit
            )))
        }
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(ApiError::PayloadTooLarge(format!(
                "{} exceeds the upload limit of {} bytes",
                file_name, limit
            )))
        }
        Err(rejection) => return Err(ApiError::BadRequest(rejection.body_text())),
    };

    let session = state
        .coordinator
        .start_import(file_name, body.to_vec())
        .await?;

    tracing::info!(
        upload_id = %session.upload_id,
        file_name = %session.file_name,
        bytes = body.len(),
        "Upload accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            upload_id: session.upload_id,
            state: session.state,
            created_at: session.created_at,
        }),
    ))
}

/// GET /import/session/{upload_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<SessionSnapshot>> {
    let session = state.coordinator.session(upload_id).await?;
    Ok(Json(SessionSnapshot::from(session)))
}

/// GET /import/progress/{upload_id}
pub async fn get_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<ProgressResponse>> {
    let (import_state, progress) = state.coordinator.progress(upload_id).await?;
    tracing::debug!(upload_id = %upload_id, state = ?import_state, "Progress query");

    Ok(Json(ProgressResponse {
        upload_id,
        state: import_state,
        progress,
    }))
}

/// POST /import/decisions/{upload_id}
///
/// All decisions are validated before any is stored; a rejected request
/// leaves the session unchanged.
pub async fn record_decisions(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
    Json(request): Json<DecisionsRequest>,
) -> ApiResult<Json<SessionSnapshot>> {
    let session = state
        .coordinator
        .record_decisions(upload_id, request.decisions)
        .await?;
    Ok(Json(SessionSnapshot::from(session)))
}

/// POST /import/commit/{upload_id}
pub async fn commit(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<ImportSummary>> {
    match state.coordinator.commit(upload_id).await {
        Ok(summary) => Ok(Json(summary)),
        Err(err) => {
            if matches!(err, IngestError::Storage { .. }) {
                *state.last_error.write().await = Some(err.to_string());
            }
            Err(err.into())
        }
    }
}

/// POST /import/cancel/{upload_id}
pub async fn cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<SessionSnapshot>> {
    let session = state.coordinator.cancel(upload_id).await?;
    tracing::info!(upload_id = %upload_id, state = ?session.state, "Import cancel requested");
    Ok(Json(SessionSnapshot::from(session)))
}

/// GET /import/errors/{upload_id}/csv
pub async fn export_errors(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let session = state.coordinator.session(upload_id).await?;
    let csv = errors_to_csv(&session.errors)?;
    let disposition = format!("attachment; filename=\"{}\"", csv_file_name(upload_id, Utc::now()));

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

fn has_gedcom_extension(file_name: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ged"))
}

/// Build import workflow routes
///
/// The upload body is capped at `max_upload_bytes`; the handler turns the
/// extractor's length-limit rejection into the JSON error envelope.
pub fn import_routes(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/import/upload",
            post(upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/import/session/:upload_id", get(get_session))
        .route("/import/progress/:upload_id", get(get_progress))
        .route("/import/decisions/:upload_id", post(record_decisions))
        .route("/import/commit/:upload_id", post(commit))
        .route("/import/cancel/:upload_id", post(cancel))
        .route("/import/errors/:upload_id/csv", get(export_errors))
}
