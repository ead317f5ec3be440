use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::auth::{self, AdminUser, AuthUser};
use crate::balance::{self, BalanceInfoResponse, HistoryResponse};
use crate::catalog::{self, ApiQuestionType, SelectionVerdict, ValidateSelectionRequest};
use crate::error::{request_id_from_headers, validation_details, AppError};
use crate::generation::{self, GenerationSession};
use crate::models::{GeneratedQuestion, GenerationStatus, SourceType, StartGenerationRequest};
use crate::sources::{self, FileUploadResponse, UploadedSource, ValidatePromptRequest};
use crate::state::AppState;
use crate::webhook::{self, SignedHeaders, WebhookAck, WebhookError};
use crate::ws_protocol::ServerMessage;

type ApiResult<T> = Result<(StatusCode, Json<T>), AppError>;

static OPENAPI_DOCUMENT: &str = include_str!("../contracts/openapi.json");

fn json_body<T>(body: Result<Json<T>, JsonRejection>, request_id: &str) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text(), request_id))
}

fn validated<T: Validate>(value: T, request_id: &str) -> Result<T, AppError> {
    match value.validate() {
        Ok(()) => Ok(value),
        Err(errors) => Err(AppError::validation("Request validation failed.", request_id)
            .with_details(validation_details(&errors))),
    }
}

pub async fn root() -> Json<Value> {
    Json(json!({ "message": "Server is healthy and running!" }))
}

pub async fn api_docs() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], OPENAPI_DOCUMENT)
}

pub async fn list_question_types(_caller: AuthUser) -> Json<&'static [ApiQuestionType]> {
    Json(catalog::QUESTION_TYPES.as_slice())
}

pub async fn validate_selection(
    caller: AuthUser,
    body: Result<Json<ValidateSelectionRequest>, JsonRejection>,
) -> ApiResult<SelectionVerdict> {
    let payload = validated(json_body(body, &caller.request_id)?, &caller.request_id)?;
    let quote = catalog::price_selection(payload.selections.iter().map(|s| (s.q_type, s.quantity)));
    let verdict = catalog::judge_selection(quote, caller.user.balance);
    let status = match verdict {
        SelectionVerdict::Valid { .. } => StatusCode::OK,
        SelectionVerdict::Insufficient { .. } => StatusCode::BAD_REQUEST,
    };
    Ok((status, Json(verdict)))
}

pub async fn upload_image(
    State(state): State<AppState>,
    caller: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<FileUploadResponse> {
    let rid = caller.request_id.as_str();
    let file = sources::read_file_field(&mut multipart, "image", "image", state.config.max_upload_bytes)
        .await
        .map_err(|e| AppError::from_failure(e, rid))?;
    sources::check_image(&file).map_err(|e| AppError::from_failure(e, rid))?;

    let file_id = format!("img-{}", uuid::Uuid::new_v4());
    let size = file.bytes.len();
    state.db.register_upload(UploadedSource {
        file_id: file_id.clone(),
        owner: caller.user.external_id.clone(),
        kind: SourceType::Image,
        file_name: file.file_name.clone(),
        size,
        mimetype: file.content_type.clone(),
        extracted_text: None,
        uploaded_at: Utc::now(),
    });
    info!(user = %caller.user.external_id, %file_id, size, "image uploaded");

    Ok((
        StatusCode::CREATED,
        Json(FileUploadResponse {
            message: "Image uploaded successfully.".into(),
            file_id,
            file_name: file.file_name,
            size: Some(size),
            mimetype: Some(file.content_type),
            character_count: None,
            preview: None,
        }),
    ))
}

pub async fn upload_pdf(
    State(state): State<AppState>,
    caller: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<FileUploadResponse> {
    let rid = caller.request_id.as_str();
    let file = sources::read_file_field(&mut multipart, "pdf", "PDF", state.config.max_upload_bytes)
        .await
        .map_err(|e| AppError::from_failure(e, rid))?;
    sources::check_pdf(&file).map_err(|e| AppError::from_failure(e, rid))?;

    let size = file.bytes.len();
    let text = sources::extract_pdf_text(file.bytes)
        .await
        .map_err(|e| AppError::from_failure(e, rid))?;
    let character_count = text.chars().count();
    let preview = sources::preview(&text);

    let file_id = format!("pdf-{}", uuid::Uuid::new_v4());
    state.db.register_upload(UploadedSource {
        file_id: file_id.clone(),
        owner: caller.user.external_id.clone(),
        kind: SourceType::Pdf,
        file_name: file.file_name.clone(),
        size,
        mimetype: file.content_type,
        extracted_text: Some(text),
        uploaded_at: Utc::now(),
    });
    info!(user = %caller.user.external_id, %file_id, size, character_count, "pdf processed");

    Ok((
        StatusCode::CREATED,
        Json(FileUploadResponse {
            message: "PDF processed successfully.".into(),
            file_id,
            file_name: file.file_name,
            size: None,
            mimetype: None,
            character_count: Some(character_count),
            preview: Some(preview),
        }),
    ))
}

pub async fn validate_prompt(
    caller: AuthUser,
    body: Result<Json<ValidatePromptRequest>, JsonRejection>,
) -> ApiResult<Value> {
    validated(json_body(body, &caller.request_id)?, &caller.request_id)?;
    Ok((StatusCode::OK, Json(json!({ "isValid": true, "message": "Prompt is valid." }))))
}

pub async fn get_balance(State(state): State<AppState>, caller: AuthUser) -> ApiResult<BalanceInfoResponse> {
    let info = balance::balance_info(
        &state.db,
        &caller.user,
        state.config.period_credits,
        state.config.usage_limits,
    )
    .await;
    Ok((StatusCode::OK, Json(info)))
}

/// Raw strings so junk like `?page=abc` falls back to defaults instead of 400.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

fn positive_or(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

pub async fn get_history(
    State(state): State<AppState>,
    caller: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryResponse> {
    let page = state
        .db
        .history_page(
            &caller.user.external_id,
            positive_or(query.page.as_deref(), 1),
            positive_or(query.limit.as_deref(), 10),
        )
        .await;
    Ok((StatusCode::OK, Json(page)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetUsagePayload {
    pub user_id: Option<String>,
}

pub async fn reset_usage(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    body: Result<Json<ResetUsagePayload>, JsonRejection>,
) -> ApiResult<Value> {
    let rid = admin.request_id.as_str();
    let payload = json_body(body, rid)?;
    let Some(user_id) = payload.user_id.filter(|id| !id.trim().is_empty()) else {
        return Err(AppError::validation("User ID is required to reset usage.", rid));
    };
    state
        .db
        .reset_usage(&user_id)
        .await
        .map_err(|e| AppError::from_failure(e, rid))?;
    info!(admin = %admin.user.external_id, user = %user_id, "usage reset by admin");
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Monthly usage for user {} has been successfully reset.", user_id)
        })),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGenerationResponse {
    pub session_id: String,
    pub initial_status: GenerationSession,
}

pub async fn start_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    caller: AuthUser,
    body: Result<Json<StartGenerationRequest>, JsonRejection>,
) -> ApiResult<StartGenerationResponse> {
    auth::enforce(&state.generation_limiter, "generation", &headers)?;
    let rid = caller.request_id.as_str();
    let request = validated(json_body(body, rid)?, rid)?;
    let owner = caller.user.external_id.clone();
    sources::check_request_source(&state.db, &owner, &request).map_err(|e| AppError::from_failure(e, rid))?;

    let quote = catalog::price_selection(request.question_types.iter().map(|q| (q.id, q.quantity)));
    let remaining = state
        .db
        .debit(&owner, quote.total_cost)
        .await
        .map_err(|e| AppError::from_failure(e, rid))?;

    let session = GenerationSession::new(uuid::Uuid::new_v4().to_string(), owner.clone(), request, quote.total_cost);
    let session_id = session.id.clone();
    state.sessions.insert(session.clone());
    info!(
        user = %owner,
        %session_id,
        cost = quote.total_cost,
        remaining,
        questions = session.request_data.requested_count(),
        "generation session started"
    );
    tokio::spawn(generation::run_generation(state.clone(), session_id.clone()));

    Ok((
        StatusCode::ACCEPTED,
        Json(StartGenerationResponse {
            session_id,
            initial_status: session,
        }),
    ))
}

fn owned_session(state: &AppState, caller: &AuthUser, session_id: &str) -> Result<GenerationSession, AppError> {
    let session = state
        .sessions
        .get(session_id)
        .ok_or_else(|| AppError::not_found("Session not found.", &caller.request_id))?;
    if session.user_id != caller.user.external_id {
        return Err(AppError::forbidden(
            "You are not authorized to view this session.",
            &caller.request_id,
        ));
    }
    Ok(session)
}

pub async fn generation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    caller: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<GenerationSession> {
    auth::enforce(&state.generation_limiter, "generation", &headers)?;
    let session = owned_session(&state, &caller, &session_id)?;
    Ok((StatusCode::OK, Json(session)))
}

pub async fn generation_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    caller: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<Vec<GeneratedQuestion>> {
    auth::enforce(&state.generation_limiter, "generation", &headers)?;
    let session = owned_session(&state, &caller, &session_id)?;
    if session.status != GenerationStatus::Completed {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "NOT_READY",
            "Generation is not yet complete.",
            &caller.request_id,
        ));
    }
    let questions = session
        .result
        .ok_or_else(|| AppError::not_found("No results found for this session.", &caller.request_id))?;
    Ok((StatusCode::OK, Json(questions)))
}

pub async fn ws_generation(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_generation(socket, state, session_id))
}

fn snapshot_frame(session: GenerationSession) -> ServerMessage {
    if session.status == GenerationStatus::Failed {
        ServerMessage::failure(session)
    } else {
        ServerMessage::status_update(session)
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "cannot encode progress frame");
            false
        }
    }
}

/// Subscribes before reading the snapshot so no transition between the two
/// is lost; the socket closes after the first terminal frame.
async fn stream_generation(mut socket: WebSocket, state: AppState, session_id: String) {
    let subscription = state.sessions.subscribe(&session_id);
    let snapshot = state.sessions.get(&session_id);
    let (Some(mut receiver), Some(snapshot)) = (subscription, snapshot) else {
        let _ = send_frame(&mut socket, &ServerMessage::not_found()).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let first = snapshot_frame(snapshot);
    if !send_frame(&mut socket, &first).await || first.is_final() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            published = receiver.recv() => {
                let frame = match published {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%session_id, skipped, "progress subscriber lagged, resending snapshot");
                        match state.sessions.get(&session_id) {
                            Some(current) => snapshot_frame(current),
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_frame(&mut socket, &frame).await || frame.is_final() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    debug!(%session_id, "progress socket closed");
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let rid = request_id_from_headers(&headers);
    let fail = |err: WebhookError| {
        warn!(error = %err, "webhook rejected");
        AppError::from_failure(err, rid.clone())
    };

    let secret = state
        .config
        .webhook_secret
        .as_deref()
        .ok_or(WebhookError::NotConfigured)
        .map_err(fail)?;
    let signed = SignedHeaders::from_headers(&headers).map_err(fail)?;
    webhook::verify(secret, &signed, &body, Utc::now().timestamp()).map_err(fail)?;
    let event = webhook::parse_event(&body).map_err(fail)?;
    info!(event_type = %event.event_type, "received webhook event");

    let ack = webhook::apply_event(&state.db, &event, state.config.signup_credits).await;
    Ok((StatusCode::OK, Json(ack)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_paging_falls_back_on_junk() {
        assert_eq!(positive_or(Some("3"), 1), 3);
        assert_eq!(positive_or(Some("abc"), 1), 1);
        assert_eq!(positive_or(Some("-1"), 10), 10);
        assert_eq!(positive_or(Some("0"), 10), 10);
        assert_eq!(positive_or(None, 10), 10);
    }
}
