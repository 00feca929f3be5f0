// backend/src/loader/delimited.rs
//
// CSV/TSV readers and the TXT delimiter sniffer.

use std::path::Path;

use super::frame::{Cell, Frame};
use super::LoaderError;

/// Candidate delimiters for plain-text sniffing, in tie-break order.
const TXT_DELIMITERS: [u8; 4] = [b',', b'\t', b'|', b';'];

/// Lines examined when scoring delimiters.
const SNIFF_LINES: usize = 20;

/// Parse a delimited file with a known separator. First row is the header.
pub fn load_delimited(
    path: &Path,
    delimiter: u8,
    limit: Option<usize>,
) -> Result<Frame, LoaderError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| malformed(path, e))?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(path, e))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        if let Some(limit) = limit {
            if rows.len() >= limit {
                break;
            }
        }
        let record = record.map_err(|e| malformed(path, e))?;
        rows.push(record.iter().map(Cell::from_str).collect());
    }

    Ok(Frame::from_rows(columns, rows))
}

/// Load a `.txt` file by electing a delimiter: each candidate is scored over
/// the first 20 lines; a candidate is consistent when every line carries the
/// same non-zero count of it, and the highest consistent count wins. When no
/// candidate is uniform the file degrades to a single text column whose name
/// is the first line.
pub fn load_txt(path: &Path, limit: Option<usize>) -> Result<Frame, LoaderError> {
    let content = std::fs::read_to_string(path)?;
    match sniff_delimiter(&content) {
        Some(delimiter) => load_delimited(path, delimiter, limit),
        None => {
            let mut lines = content.lines();
            let header = match lines.next() {
                Some(line) => line.trim().to_string(),
                None => return Ok(Frame::from_rows(vec!["text".to_string()], Vec::new())),
            };
            let mut rows: Vec<Vec<Cell>> = lines
                .map(|line| vec![Cell::from_str(line)])
                .collect();
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            Ok(Frame::from_rows(vec![header], rows))
        }
    }
}

/// Score candidate delimiters over the first lines of `content`.
pub fn sniff_delimiter(content: &str) -> Option<u8> {
    let lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    if lines.len() < 2 {
        return None;
    }

    let mut best: Option<(u8, usize)> = None;
    for &candidate in &TXT_DELIMITERS {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.bytes().filter(|b| *b == candidate).count())
            .collect();
        let first = counts[0];
        if first == 0 || counts.iter().any(|c| *c != first) {
            continue;
        }
        match best {
            Some((_, score)) if score >= first => {}
            _ => best = Some((candidate, first)),
        }
    }
    best.map(|(delimiter, _)| delimiter)
}

fn malformed(path: &Path, err: csv::Error) -> LoaderError {
    LoaderError::MalformedCsv(format!("{}: {}", path.display(), err))
}
