// backend/src/loader/frame.rs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inferred column type, by majority vote over sampled rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Boolean,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single table cell. `Null` is the one missing-value sentinel; no
/// format-specific residue (NaN strings, empty markers, JSON null) survives
/// past the loader.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Real(f64),
    Bool(bool),
    Text(String),
}

static DATE_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}([T ].*)?|\d{1,2}/\d{1,2}/\d{2,4}|\d{4}/\d{2}/\d{2})$")
        .expect("date pattern is valid")
});

impl Cell {
    /// Parse a raw string the way every loader does, so the same value is
    /// represented identically regardless of source format.
    pub fn from_str(raw: &str) -> Cell {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Cell::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Cell::Real(f);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Cell::Bool(true),
            "false" => return Cell::Bool(false),
            _ => {}
        }
        Cell::Text(trimmed.to_string())
    }

    /// Collapse a float that holds an exact integer, so `1000.0` from a
    /// spreadsheet stringifies the same as `1000` from a CSV.
    pub fn from_f64(f: f64) -> Cell {
        if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            Cell::Int(f as i64)
        } else if f.is_finite() {
            Cell::Real(f)
        } else {
            Cell::Null
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// The classification used for the column-type vote. `None` for nulls,
    /// which do not vote.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Cell::Null => None,
            Cell::Int(_) => Some(ColumnType::Integer),
            Cell::Real(_) => Some(ColumnType::Real),
            Cell::Bool(_) => Some(ColumnType::Boolean),
            Cell::Text(s) => {
                if DATE_LIKE.is_match(s) {
                    Some(ColumnType::Date)
                } else {
                    Some(ColumnType::Text)
                }
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(i) => Some(*i as f64),
            Cell::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Uniform stringification; nulls render as the empty string.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Int(i) => i.to_string(),
            Cell::Real(f) => f.to_string(),
            Cell::Bool(b) => b.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Rows sampled for the column-type vote.
const TYPE_SAMPLE_ROWS: usize = 200;

/// The unified in-memory table every loader produces: ordered column names,
/// per-column inferred types, row-major cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub types: Vec<ColumnType>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    /// Build a frame from parsed cells, inferring column types by majority
    /// vote over up to the first 200 rows. Priority on a tied vote is
    /// integer > real > date > boolean, with text as the conflict fallback.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Frame {
        let types = infer_column_types(columns.len(), &rows);
        Frame {
            columns,
            types,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Up to `n` non-null sample values from a column, stringified.
    pub fn sample_values(&self, column: usize, n: usize) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|cell| !cell.is_null())
            .take(n)
            .map(Cell::render)
            .collect()
    }

    /// Truncate to the first `n` rows, preserving inferred types.
    pub fn head(mut self, n: usize) -> Frame {
        self.rows.truncate(n);
        self
    }

    /// Render the frame as CSV text; the normalized shape handed to
    /// generated code by the loader shim.
    pub fn to_csv_string(&self) -> String {
        let mut out = String::new();
        let escape = |field: &str| -> String {
            if field.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.to_string()
            }
        };
        out.push_str(
            &self
                .columns
                .iter()
                .map(|c| escape(c))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
        for row in &self.rows {
            out.push_str(
                &row.iter()
                    .map(|c| escape(&c.render()))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            out.push('\n');
        }
        out
    }
}

fn infer_column_types(column_count: usize, rows: &[Vec<Cell>]) -> Vec<ColumnType> {
    (0..column_count)
        .map(|col| {
            let mut counts: [usize; 5] = [0; 5];
            for row in rows.iter().take(TYPE_SAMPLE_ROWS) {
                if let Some(kind) = row.get(col).and_then(Cell::column_type) {
                    counts[vote_slot(kind)] += 1;
                }
            }
            elect_type(&counts)
        })
        .collect()
}

fn vote_slot(kind: ColumnType) -> usize {
    match kind {
        ColumnType::Integer => 0,
        ColumnType::Real => 1,
        ColumnType::Date => 2,
        ColumnType::Boolean => 3,
        ColumnType::Text => 4,
    }
}

fn elect_type(counts: &[usize; 5]) -> ColumnType {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return ColumnType::Text;
    }
    // Integers mixed with reals are a numeric column, not a conflict.
    if counts[0] + counts[1] == total {
        return if counts[1] > 0 {
            ColumnType::Real
        } else {
            ColumnType::Integer
        };
    }
    let max = *counts.iter().max().expect("counts is non-empty");
    let order = [
        ColumnType::Integer,
        ColumnType::Real,
        ColumnType::Date,
        ColumnType::Boolean,
        ColumnType::Text,
    ];
    let winners: Vec<ColumnType> = order
        .iter()
        .copied()
        .filter(|k| counts[vote_slot(*k)] == max)
        .collect();
    if winners.len() == 1 {
        winners[0]
    } else {
        ColumnType::Text
    }
}
