// backend/src/loader/json.rs
//
// JSON loading with structure sniffing. Three strategies are attempted in
// order, chosen by the first non-whitespace byte:
//   1. top-level array of objects
//   2. top-level object wrapping exactly one array-valued field
//   3. newline-delimited objects (one per line)

use serde_json::Value;
use std::path::Path;

use super::frame::{Cell, Frame};
use super::LoaderError;

pub fn load_json(path: &Path, limit: Option<usize>) -> Result<Frame, LoaderError> {
    let content = std::fs::read_to_string(path)?;
    let first = content.trim_start().bytes().next();

    match first {
        Some(b'[') => {
            let value: Value = serde_json::from_str(&content)
                .map_err(|e| malformed(path, &e.to_string()))?;
            let items = value
                .as_array()
                .expect("sniffed token guarantees an array");
            frame_from_objects(items, limit).map_err(|msg| malformed(path, &msg))
        }
        Some(b'{') => {
            // A whole-document object first; if it is not a single-array
            // wrapper, the file may still be newline-delimited objects.
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&content) {
                let array_fields: Vec<&Value> =
                    map.values().filter(|v| v.is_array()).collect();
                if array_fields.len() == 1 {
                    let items = array_fields[0]
                        .as_array()
                        .expect("filtered on is_array");
                    return frame_from_objects(items, limit)
                        .map_err(|msg| malformed(path, &msg));
                }
            }
            load_ndjson(&content, limit).map_err(|msg| malformed(path, &msg))
        }
        Some(_) | None => Err(malformed(path, "document is not an array or object")),
    }
}

fn load_ndjson(content: &str, limit: Option<usize>) -> Result<Frame, String> {
    let mut items = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("line is not an object: {e}"))?;
        items.push(value);
    }
    if items.is_empty() {
        return Err("no objects found".to_string());
    }
    frame_from_objects(&items, limit)
}

/// Rows are the objects; columns are the union of keys in first-seen order.
fn frame_from_objects(items: &[Value], limit: Option<usize>) -> Result<Frame, String> {
    let mut columns: Vec<String> = Vec::new();
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| "array element is not an object".to_string())?;
        for key in obj.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let take = limit.unwrap_or(items.len());
    let rows: Vec<Vec<Cell>> = items
        .iter()
        .take(take)
        .map(|item| {
            let obj = item.as_object().expect("validated above");
            columns
                .iter()
                .map(|col| obj.get(col).map_or(Cell::Null, value_to_cell))
                .collect()
        })
        .collect();

    Ok(Frame::from_rows(columns, rows))
}

fn value_to_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Cell::Int(i)
            } else if let Some(f) = n.as_f64() {
                Cell::from_f64(f)
            } else {
                Cell::Text(n.to_string())
            }
        }
        Value::String(s) => Cell::from_str(s),
        // Nested structures stay opaque; stringified JSON is still one cell.
        other => Cell::Text(other.to_string()),
    }
}

fn malformed(path: &Path, detail: &str) -> LoaderError {
    LoaderError::MalformedJson(format!("{}: {}", path.display(), detail))
}
