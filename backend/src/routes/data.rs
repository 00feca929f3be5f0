// backend/src/routes/data.rs
//
// Data-file management: listing, metadata with a head preview, upload.
// The service never deletes data files.

use axum::{
    Json, Router,
    extract::{Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tracing::{info, instrument};

use crate::errors::AppError;
use crate::loader::{FileLoader, DEFAULT_HEAD_ROWS};
use crate::models::files::{format_bytes, list_data_files, FileFormat};
use crate::state::AppState;

pub fn data_routes() -> Router<AppState> {
    Router::new()
        .route("/data", get(list_files).post(upload_file))
        .route("/data/{filename}/info", get(file_info))
}

/// Keep only the final path component and refuse traversal attempts.
fn sanitize_filename(raw: &str) -> Result<String, AppError> {
    let name = std::path::Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::InputRejected("Invalid filename".to_string()))?;
    if name.contains("..") || name.is_empty() {
        return Err(AppError::InputRejected("Invalid filename".to_string()));
    }
    Ok(name.to_string())
}

#[instrument(skip(state))]
pub async fn list_files(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let files = list_data_files(&state.config.data_dir)?;
    let listing: Vec<_> = files
        .iter()
        .map(|f| {
            json!({
                "filename": f.name,
                "size_bytes": f.size,
                "size_human": f.size_human(),
                "format": f.format,
                "modified": f.mtime,
            })
        })
        .collect();
    Ok(Json(json!({
        "files": listing,
        "count": files.len(),
        "data_dir": state.config.data_dir,
    })))
}

/// Metadata plus a head-only preview through the loader.
#[instrument(skip(state))]
pub async fn file_info(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let name = sanitize_filename(&filename)?;
    let files = list_data_files(&state.config.data_dir)?;
    let file = files
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| AppError::NotFound(format!("File '{name}' not found")))?;

    let loader = FileLoader::new(state.config.max_file_bytes);
    let path = state.config.data_dir.join(&file.name);
    let preview = match loader.load_head(&path, DEFAULT_HEAD_ROWS) {
        Ok(frame) => {
            let rows: Vec<Vec<String>> = frame
                .rows
                .iter()
                .map(|row| row.iter().map(|c| c.render()).collect())
                .collect();
            json!({
                "columns": frame.columns,
                "types": frame.types,
                "rows": rows,
            })
        }
        Err(e) => json!({ "error": e.to_string() }),
    };

    Ok(Json(json!({
        "filename": file.name,
        "size_bytes": file.size,
        "size_human": file.size_human(),
        "format": file.format,
        "modified": file.mtime,
        "preview": preview,
    })))
}

/// Multipart upload of a new data file. Extension must be supported and the
/// payload must fit the configured ceiling; `overwrite=true` replaces an
/// existing file.
#[instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut overwrite = false;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::InputRejected("No file selected".to_string()))?;
                let bytes = field.bytes().await?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("overwrite") => {
                let value = field.text().await?;
                overwrite = value.eq_ignore_ascii_case("true");
            }
            _ => {}
        }
    }

    let (raw_name, bytes) = file
        .ok_or_else(|| AppError::InputRejected("No file provided".to_string()))?;
    let name = sanitize_filename(&raw_name)?;

    let format = FileFormat::from_path(std::path::Path::new(&name)).ok_or_else(|| {
        AppError::InputRejected(
            "File type not allowed. Allowed types: csv, tsv, json, xlsx, xls, txt".to_string(),
        )
    })?;

    if bytes.len() as u64 > state.config.max_file_bytes {
        return Err(AppError::InputRejected(format!(
            "File exceeds the {} limit",
            format_bytes(state.config.max_file_bytes)
        )));
    }

    let path = state.config.data_dir.join(&name);
    if path.exists() && !overwrite {
        return Err(AppError::Conflict(format!(
            "File '{name}' already exists. Use overwrite=true to replace it."
        )));
    }

    tokio::fs::create_dir_all(&state.config.data_dir).await?;
    tokio::fs::write(&path, &bytes).await?;
    info!(file = %name, bytes = bytes.len(), "Data file uploaded");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "File uploaded successfully",
            "file": {
                "filename": name,
                "size_bytes": bytes.len(),
                "size_human": format_bytes(bytes.len() as u64),
                "format": format,
            }
        })),
    ))
}
