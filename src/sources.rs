use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use validator::Validate;

use crate::error::HttpFailure;
use crate::models::{SourceType, StartGenerationRequest};
use crate::state::InMemoryDb;

pub const IMAGE_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];
pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("No {0} file uploaded.")]
    MissingFile(&'static str),
    #[error("Invalid file type. Only JPG, PNG, and GIF images are allowed.")]
    NotAnImage,
    #[error("Invalid file type. Only PDF files are allowed.")]
    NotAPdf,
    #[error("File exceeds the {limit} byte upload limit.")]
    TooLarge { limit: usize },
    #[error("Malformed upload: {0}")]
    Multipart(String),
    #[error("Failed to parse the PDF file. It might be corrupted or protected.")]
    PdfUnreadable,
    #[error("Source text is required when sourceType is text.")]
    MissingText,
    #[error("Source file {0} was not found.")]
    UnknownFile(String),
    #[error("Source file {file_id} is not a {expected} upload.")]
    KindMismatch { file_id: String, expected: &'static str },
}

impl HttpFailure for SourceError {
    fn status(&self) -> StatusCode {
        match self {
            SourceError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SourceError::PdfUnreadable => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SourceError::TooLarge { .. } => "PAYLOAD_TOO_LARGE",
            SourceError::PdfUnreadable => "UNPROCESSABLE",
            _ => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedSource {
    pub file_id: String,
    pub owner: String,
    pub kind: SourceType,
    pub file_name: String,
    pub size: usize,
    pub mimetype: String,
    pub extracted_text: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IncomingFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadResponse {
    pub message: String,
    pub file_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidatePromptRequest {
    #[validate(length(min = 20, max = 5000, message = "Prompt must be between 20 and 5000 characters."))]
    pub prompt: String,
}

fn multipart_error(err: MultipartError, max_bytes: usize) -> SourceError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SourceError::TooLarge { limit: max_bytes }
    } else {
        SourceError::Multipart(err.body_text())
    }
}

/// Pulls the named file field out of a multipart body; other fields are
/// drained and ignored.
pub async fn read_file_field(
    multipart: &mut Multipart,
    field_name: &'static str,
    kind_label: &'static str,
    max_bytes: usize,
) -> Result<IncomingFile, SourceError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if field.name() != Some(field_name) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, max_bytes))?;
        if bytes.len() > max_bytes {
            return Err(SourceError::TooLarge { limit: max_bytes });
        }
        if bytes.is_empty() {
            return Err(SourceError::MissingFile(kind_label));
        }
        debug!(field = field_name, size = bytes.len(), %content_type, "multipart file received");
        return Ok(IncomingFile { file_name, content_type, bytes: bytes.to_vec() });
    }
    Err(SourceError::MissingFile(kind_label))
}

pub fn check_image(file: &IncomingFile) -> Result<(), SourceError> {
    if IMAGE_MIME_TYPES.contains(&file.content_type.as_str()) {
        Ok(())
    } else {
        Err(SourceError::NotAnImage)
    }
}

pub fn check_pdf(file: &IncomingFile) -> Result<(), SourceError> {
    if file.content_type == PDF_MIME_TYPE {
        Ok(())
    } else {
        Err(SourceError::NotAPdf)
    }
}

/// Runs text extraction off the async runtime. The extractor may panic on
/// hostile input, which surfaces here as a join error.
pub async fn extract_pdf_text(bytes: Vec<u8>) -> Result<String, SourceError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(SourceError::PdfUnreadable);
    }
    let joined = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await;
    match joined {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => {
            warn!(error = %err, "pdf text extraction failed");
            Err(SourceError::PdfUnreadable)
        }
        Err(err) => {
            warn!(error = %err, "pdf text extraction aborted");
            Err(SourceError::PdfUnreadable)
        }
    }
}

pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

impl InMemoryDb {
    pub fn register_upload(&self, upload: UploadedSource) {
        self.uploads.insert(upload.file_id.clone(), upload);
    }

    /// Drops uploads older than `retention`. Returns how many were removed.
    pub fn evict_uploads(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let before = self.uploads.len();
        self.uploads.retain(|_, upload| {
            (now - upload.uploaded_at)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true)
        });
        before.saturating_sub(self.uploads.len())
    }

    pub fn find_upload(&self, owner: &str, file_id: &str) -> Option<UploadedSource> {
        self.uploads
            .get(file_id)
            .filter(|u| u.owner == owner)
            .map(|u| u.clone())
    }
}

/// Source checks the validator derive cannot express: text sources carry
/// text, and a referenced file belongs to the caller and matches the kind.
pub fn check_request_source(db: &InMemoryDb, owner: &str, request: &StartGenerationRequest) -> Result<(), SourceError> {
    if request.source_type == SourceType::Text
        && request.source_text.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        return Err(SourceError::MissingText);
    }
    if let Some(file_id) = request.source_file_id.as_deref() {
        let upload = db
            .find_upload(owner, file_id)
            .ok_or_else(|| SourceError::UnknownFile(file_id.to_string()))?;
        if upload.kind != request.source_type {
            return Err(SourceError::KindMismatch {
                file_id: file_id.to_string(),
                expected: request.source_type.as_str(),
            });
        }
    }
    Ok(())
}
