//! Cover-image upload.
//!
//! Multipart `file` field written to a local blob directory; the response
//! mirrors the metadata shape of the hosted blob store the original used.

use std::fs;
use std::path::Path;

use axum::extract::multipart::Multipart;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub url: String,
    pub pathname: String,
    pub content_type: String,
    pub size: usize,
}

/// Keep the original name readable but safe, and make the stored name
/// unique with a short id prefix.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Write the bytes and return blob metadata.
pub fn save_upload(
    upload_dir: &Path,
    base_url: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<BlobInfo, AppError> {
    if bytes.is_empty() {
        return Err(AppError::Validation("Uploaded file is empty".into()));
    }

    fs::create_dir_all(upload_dir)
        .map_err(|e| AppError::Internal(format!("create upload dir: {e}")))?;

    let short = Uuid::new_v4().simple().to_string();
    let stored_name = format!("{}-{}", &short[..8], sanitize_filename(filename));
    let path = upload_dir.join(&stored_name);

    fs::write(&path, bytes).map_err(|e| AppError::Internal(format!("write upload: {e}")))?;

    info!(file = %stored_name, size = bytes.len(), "file uploaded");

    Ok(BlobInfo {
        url: format!("{}/{stored_name}", base_url.trim_end_matches('/')),
        pathname: stored_name,
        content_type: content_type.to_string(),
        size: bytes.len(),
    })
}

/// Pull the `file` field out of the multipart form.
pub async fn read_file_field(
    multipart: &mut Multipart,
) -> Result<(String, String, Vec<u8>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read file field: {e}")))?;
        return Ok((filename, content_type, bytes.to_vec()));
    }
    Err(AppError::Validation("Missing form field: file".into()))
}
