// backend/src/loader/excel.rs
//
// Excel (.xlsx/.xls) loading: first worksheet only, header row is the first
// non-empty row, trailing blank rows are trimmed.

use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

use super::frame::{Cell, Frame};
use super::LoaderError;

pub fn load_excel(path: &Path, limit: Option<usize>) -> Result<Frame, LoaderError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| malformed(path, &e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| malformed(path, "workbook has no worksheets"))?
        .map_err(|e| malformed(path, &e.to_string()))?;

    let mut raw_rows = range.rows();
    let header = loop {
        match raw_rows.next() {
            Some(row) if row.iter().any(|c| !matches!(c, Data::Empty)) => break row,
            Some(_) => continue,
            None => return Err(malformed(path, "worksheet has no non-empty rows")),
        }
    };

    let columns: Vec<String> = header.iter().map(data_to_header).collect();

    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for row in raw_rows {
        if let Some(limit) = limit {
            if rows.len() >= limit {
                break;
            }
        }
        let cells: Vec<Cell> = (0..columns.len())
            .map(|i| row.get(i).map_or(Cell::Null, data_to_cell))
            .collect();
        rows.push(cells);
    }

    // Trailing blank rows are artifacts of spreadsheet editing, not data.
    while rows.last().is_some_and(|row| row.iter().all(Cell::is_null)) {
        rows.pop();
    }

    Ok(Frame::from_rows(columns, rows))
}

fn data_to_header(data: &Data) -> String {
    match data {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => data_to_cell(other).render(),
    }
}

fn data_to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Null,
        Data::Int(i) => Cell::Int(*i),
        Data::Float(f) => Cell::from_f64(*f),
        Data::Bool(b) => Cell::Bool(*b),
        // Strings go through the shared parser so a numeric-looking cell
        // stringifies identically to its CSV counterpart.
        Data::String(s) => Cell::from_str(s),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => Cell::Text(naive.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => Cell::from_f64(dt.as_f64()),
        },
        Data::DateTimeIso(s) => Cell::Text(s.clone()),
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(format!("{e:?}")),
    }
}

fn malformed(path: &Path, detail: &str) -> LoaderError {
    LoaderError::MalformedExcel(format!("{}: {}", path.display(), detail))
}
