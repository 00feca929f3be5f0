// backend/src/loader/mod.rs
//
// Content-aware tabular loading. Dispatch is by extension; every format
// lands in the same Frame shape with one missing-value sentinel.

use std::path::Path;
use thiserror::Error;

pub mod delimited;
pub mod excel;
pub mod frame;
pub mod json;

pub use frame::{Cell, ColumnType, Frame};

use crate::models::files::FileFormat;
use crate::models::jobs::JobErrorKind;

/// Default row count for head-only loads used by the schema inspector.
pub const DEFAULT_HEAD_ROWS: usize = 5;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed CSV: {0}")]
    MalformedCsv(String),

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("malformed Excel workbook: {0}")]
    MalformedExcel(String),

    #[error("file too large: {name} is {size} bytes (limit {limit})")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    /// The job-level error kind this fault surfaces as when it is terminal.
    pub fn job_error_kind(&self) -> JobErrorKind {
        match self {
            LoaderError::NotFound(_) => JobErrorKind::NotFound,
            LoaderError::UnsupportedFormat(_) => JobErrorKind::UnsupportedFormat,
            LoaderError::MalformedCsv(_) => JobErrorKind::MalformedCsv,
            LoaderError::MalformedJson(_) => JobErrorKind::MalformedJson,
            LoaderError::MalformedExcel(_) => JobErrorKind::MalformedExcel,
            LoaderError::FileTooLarge { .. } => JobErrorKind::FileTooLarge,
            LoaderError::Io(_) => JobErrorKind::Internal,
        }
    }
}

/// Loads data files into Frames, bounded by a raw-byte ceiling.
#[derive(Debug, Clone)]
pub struct FileLoader {
    max_file_bytes: u64,
}

impl FileLoader {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    /// Load the whole file.
    pub fn load(&self, path: &Path) -> Result<Frame, LoaderError> {
        self.load_inner(path, None)
    }

    /// Load only the first `n` data rows; the cheap mode used for schema
    /// inspection. Parsing stops early where the format allows it.
    pub fn load_head(&self, path: &Path, n: usize) -> Result<Frame, LoaderError> {
        self.load_inner(path, Some(n))
    }

    fn load_inner(&self, path: &Path, limit: Option<usize>) -> Result<Frame, LoaderError> {
        if !path.is_file() {
            return Err(LoaderError::NotFound(path.display().to_string()));
        }

        let size = std::fs::metadata(path)?.len();
        if size > self.max_file_bytes {
            return Err(LoaderError::FileTooLarge {
                name: path.display().to_string(),
                size,
                limit: self.max_file_bytes,
            });
        }

        let format = FileFormat::from_path(path).ok_or_else(|| {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("<none>");
            LoaderError::UnsupportedFormat(ext.to_string())
        })?;

        match format {
            FileFormat::Csv => delimited::load_delimited(path, b',', limit),
            FileFormat::Tsv => delimited::load_delimited(path, b'\t', limit),
            FileFormat::Json => json::load_json(path, limit),
            FileFormat::Xlsx | FileFormat::Xls => excel::load_excel(path, limit),
            FileFormat::Txt => delimited::load_txt(path, limit),
        }
    }
}
