//! POST /transcribe
//!
//! Accepts either a raw audio body (options in the query string) or a
//! `multipart/form-data` form with an `audio` (or `file`) part and optional
//! `language`, `decoder` and `reference` text parts.

use axum::{
    extract::{
        multipart::{Field, Multipart},
        FromRequest, Query, Request, State,
    },
    http::{header, HeaderMap},
    routing::post,
    Json, Router,
};
use tokio::time::timeout_at;
use tracing::info;
use transcribe_common::api::TranscribeResponse;

use crate::error::{ApiResult, TranscriptionError, ValidationError};
use crate::ingest::{DeclaredUpload, UploadedAudio};
use crate::service::{RequestOptions, RequestTracker, TranscriptionResult, TranscriptionService};
use crate::AppState;

/// Cap on any text part of a multipart form
const MAX_TEXT_FIELD_BYTES: usize = 64 * 1024;

/// POST /transcribe
pub async fn transcribe(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<TranscribeResponse>> {
    let content_type = header_str(request.headers(), header::CONTENT_TYPE);
    let is_multipart = content_type
        .as_deref()
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false);

    let result = if is_multipart {
        transcribe_multipart(&state, request).await?
    } else {
        transcribe_raw(&state.service, request).await?
    };

    info!(
        request_id = %result.request_id,
        language = %result.language,
        decoder = %result.decoder,
        duration_ms = result.processing_duration.as_millis() as u64,
        text_chars = result.text.chars().count(),
        "Transcription complete"
    );

    Ok(Json(result.into()))
}

async fn transcribe_raw(
    service: &TranscriptionService,
    request: Request,
) -> Result<TranscriptionResult, TranscriptionError> {
    let options = match Query::<RequestOptions>::try_from_uri(request.uri()) {
        Ok(Query(options)) => options,
        Err(rejection) => {
            // Still counts as a request so the terminal counters stay honest
            let tracker = service.begin();
            return tracker.finish(Err(ValidationError::Malformed(rejection.body_text()).into()));
        }
    };

    let declared = DeclaredUpload {
        content_type: header_str(request.headers(), header::CONTENT_TYPE),
        file_name: None,
        length: header_str(request.headers(), header::CONTENT_LENGTH)
            .and_then(|len| len.trim().parse::<u64>().ok()),
    };

    let body = request.into_body().into_data_stream();
    service.handle(body, &declared, &options).await
}

async fn transcribe_multipart(
    state: &AppState,
    request: Request,
) -> Result<TranscriptionResult, TranscriptionError> {
    let service = &state.service;
    let mut tracker = service.begin();

    let query_options = Query::<RequestOptions>::try_from_uri(request.uri())
        .map(|Query(options)| options)
        .unwrap_or_default();
    let result = match Multipart::from_request(request, state).await {
        Ok(multipart) => read_form(service, &mut tracker, multipart, query_options).await,
        Err(rejection) => Err(ValidationError::Malformed(rejection.body_text()).into()),
    };

    tracker.finish(result)
}

/// Walk the form parts in order. Option parts may follow the audio part, so
/// options are resolved only once the whole form has been read.
async fn read_form(
    service: &TranscriptionService,
    tracker: &mut RequestTracker,
    mut multipart: Multipart,
    mut options: RequestOptions,
) -> Result<TranscriptionResult, TranscriptionError> {
    let deadline = tracker.context().deadline();
    let mut audio: Option<UploadedAudio> = None;

    loop {
        let field = timeout_at(deadline, multipart.next_field())
            .await
            .map_err(|_| TranscriptionError::Cancelled { stage: "upload" })?
            .map_err(|e| ValidationError::Malformed(e.body_text()))?;
        let Some(field) = field else { break };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio" | "file" => {
                if audio.is_some() {
                    return Err(ValidationError::Malformed("more than one audio part".into()).into());
                }
                let declared = DeclaredUpload {
                    content_type: field.content_type().map(str::to_string),
                    file_name: field.file_name().map(str::to_string),
                    length: None,
                };
                audio = Some(service.ingest(tracker, field, &declared).await?);
            }
            "language" => options.language = Some(read_text(field, &name, tracker).await?),
            "decoder" => options.decoder = Some(read_text(field, &name, tracker).await?),
            "reference" => options.reference = Some(read_text(field, &name, tracker).await?),
            // Unknown parts are skipped by the next `next_field` call
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| {
        ValidationError::Malformed("multipart form has no 'audio' or 'file' part".into())
    })?;
    let resolved = service.resolve_options(tracker, &options)?;
    service.run(tracker, audio, resolved).await
}

async fn read_text(
    mut field: Field<'_>,
    name: &str,
    tracker: &RequestTracker,
) -> Result<String, TranscriptionError> {
    let deadline = tracker.context().deadline();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let chunk = timeout_at(deadline, field.chunk())
            .await
            .map_err(|_| TranscriptionError::Cancelled { stage: "upload" })?
            .map_err(|e| ValidationError::Malformed(e.body_text()))?;
        let Some(chunk) = chunk else { break };

        if buf.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(ValidationError::InvalidOption(format!(
                "'{}' exceeds {} bytes",
                name, MAX_TEXT_FIELD_BYTES
            ))
            .into());
        }
        buf.extend_from_slice(&chunk);
    }

    String::from_utf8(buf)
        .map_err(|_| ValidationError::InvalidOption(format!("'{}' is not valid UTF-8", name)).into())
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn transcribe_routes() -> Router<AppState> {
    Router::new().route("/transcribe", post(transcribe))
}
