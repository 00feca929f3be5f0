// backend/src/services/schema_inspector.rs
//
// Cheap, side-effect-free schema derivation. Each data file is read through
// the loader's head-only mode; the derived summaries are formatted for
// inclusion in a model prompt and recomputed on every job.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::loader::{ColumnType, FileLoader, LoaderError, DEFAULT_HEAD_ROWS};
use crate::models::files::{format_bytes, list_data_files, DataFile, FileFormat};
use crate::services::semantic_lexicon;

/// Sample values captured per column.
const SAMPLES_PER_COLUMN: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub inferred_type: ColumnType,
    pub sample_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub file: String,
    pub format: FileFormat,
    pub row_count_estimate: u64,
    pub columns: Vec<ColumnSchema>,
    /// Ordered (column, synonyms) pairs for columns that matched a concept.
    pub semantic_hints: Vec<(String, Vec<String>)>,
}

/// One cross-file correspondence group: a concept and the `file:column`
/// references whose dominant concept it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrespondenceGroup {
    pub concept: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SchemaInspector {
    loader: FileLoader,
    head_rows: usize,
}

impl SchemaInspector {
    pub fn new(loader: FileLoader) -> Self {
        Self {
            loader,
            head_rows: DEFAULT_HEAD_ROWS,
        }
    }

    pub fn with_head_rows(loader: FileLoader, head_rows: usize) -> Self {
        Self { loader, head_rows }
    }

    /// Derive the schema of one data file from a head-only frame.
    pub fn inspect_file(&self, data_dir: &Path, file: &DataFile) -> Result<Schema, LoaderError> {
        let path = data_dir.join(&file.name);
        let frame = self.loader.load_head(&path, self.head_rows)?;

        let columns: Vec<ColumnSchema> = frame
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnSchema {
                name: name.clone(),
                inferred_type: frame.types[i],
                sample_values: frame.sample_values(i, SAMPLES_PER_COLUMN),
            })
            .collect();

        let semantic_hints = columns
            .iter()
            .filter_map(|col| {
                let hints = semantic_lexicon::hints_for_column(&col.name);
                (!hints.is_empty()).then(|| (col.name.clone(), hints))
            })
            .collect();

        let row_count_estimate = estimate_row_count(file.size, &frame, self.head_rows);

        debug!(
            file = %file.name,
            columns = columns.len(),
            rows_estimated = row_count_estimate,
            "Derived schema"
        );

        Ok(Schema {
            file: file.name.clone(),
            format: file.format,
            row_count_estimate,
            columns,
            semantic_hints,
        })
    }

    /// Derive schemas for every data file in the directory. Files that fail
    /// to parse are reported alongside the successes rather than aborting
    /// the whole inspection.
    pub fn inspect_dir(
        &self,
        data_dir: &Path,
    ) -> std::io::Result<(Vec<Schema>, Vec<(String, LoaderError)>)> {
        let files = list_data_files(data_dir)?;
        let mut schemas = Vec::new();
        let mut failures = Vec::new();
        for file in &files {
            match self.inspect_file(data_dir, file) {
                Ok(schema) => schemas.push(schema),
                Err(err) => {
                    warn!(file = %file.name, error = %err, "Schema inspection failed for file");
                    failures.push((file.name.clone(), err));
                }
            }
        }
        Ok((schemas, failures))
    }
}

fn estimate_row_count(file_size: u64, frame: &crate::loader::Frame, head_rows: usize) -> u64 {
    let loaded = frame.row_count() as u64;
    if frame.row_count() < head_rows {
        return loaded;
    }
    // Extrapolate from the average rendered row width of the head sample.
    let rendered: usize = frame
        .rows
        .iter()
        .map(|row| row.iter().map(|c| c.render().len() + 1).sum::<usize>())
        .sum();
    if rendered == 0 {
        return loaded;
    }
    let avg_row_bytes = (rendered as f64 / loaded as f64).max(1.0);
    ((file_size as f64 / avg_row_bytes).round() as u64).max(loaded)
}

/// Group columns across files by their dominant semantic concept. Groups
/// come out in lexicon order; columns with no concept are reported per-file.
pub fn column_correspondences(schemas: &[Schema]) -> (Vec<CorrespondenceGroup>, Vec<String>) {
    let mut groups: Vec<CorrespondenceGroup> = semantic_lexicon::concepts()
        .iter()
        .map(|c| CorrespondenceGroup {
            concept: c.concept.clone(),
            columns: Vec::new(),
        })
        .collect();
    let mut unmatched = Vec::new();

    for schema in schemas {
        for col in &schema.columns {
            let reference = format!("{}:{}", schema.file, col.name);
            match semantic_lexicon::dominant_concept(&col.name) {
                Some(concept) => {
                    if let Some(group) = groups.iter_mut().find(|g| g.concept == concept) {
                        group.columns.push(reference);
                    }
                }
                None => unmatched.push(reference),
            }
        }
    }

    groups.retain(|g| !g.columns.is_empty());
    (groups, unmatched)
}

/// Per-file schema description formatted for the model prompt.
pub fn schema_summary(schemas: &[Schema]) -> String {
    let mut out = String::from("DATA SCHEMA ANALYSIS\n");
    for schema in schemas {
        writeln!(
            out,
            "\n{} ({}) — approx. {} rows, {} columns",
            schema.file,
            schema.format,
            schema.row_count_estimate,
            schema.columns.len()
        )
        .expect("writing to String cannot fail");
        for col in &schema.columns {
            let samples = if col.sample_values.is_empty() {
                "[no data]".to_string()
            } else {
                col.sample_values.join(", ")
            };
            writeln!(out, "  - {} ({}): {}", col.name, col.inferred_type, samples)
                .expect("writing to String cannot fail");
        }
        if !schema.semantic_hints.is_empty() {
            out.push_str("  Users may refer to these columns as:\n");
            for (column, hints) in &schema.semantic_hints {
                writeln!(out, "    {} -> {}", column, hints.join(", "))
                    .expect("writing to String cannot fail");
            }
        }
    }
    out
}

/// The multi-file normalization guide: per-file schemas plus cross-file
/// column groupings, formatted for the model prompt.
pub fn normalization_guide(schemas: &[Schema]) -> String {
    let mut guide = String::from("DATA NORMALIZATION GUIDE\n\n");
    guide.push_str(&schema_summary(schemas));

    let (groups, unmatched) = column_correspondences(schemas);
    if !groups.is_empty() {
        guide.push_str("\nColumns that likely describe the same thing across files:\n");
        for group in &groups {
            writeln!(guide, "  {}: {}", group.concept, group.columns.join(", "))
                .expect("writing to String cannot fail");
        }
    }
    if !unmatched.is_empty() {
        guide.push_str("\nColumns unique to one file:\n");
        for reference in &unmatched {
            writeln!(guide, "  {reference}").expect("writing to String cannot fail");
        }
    }

    guide.push_str(
        "\nWhen combining files: rename matching columns to one name, convert \
         types to agree, standardize string values, add missing columns as \
         nulls, and only then concatenate.\n",
    );
    guide
}

/// One-line listing of all files with sizes and formats.
pub fn file_listing(files: &[DataFile]) -> String {
    files
        .iter()
        .map(|f| format!("{} ({}, {})", f.name, f.format, format_bytes(f.size)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write as _;

    fn write_file(dir: &Path, name: &str, content: &str) -> DataFile {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        DataFile {
            name: name.to_string(),
            size: content.len() as u64,
            mtime: Utc::now(),
            format: FileFormat::from_path(&path).unwrap(),
        }
    }

    #[test]
    fn schema_captures_types_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(
            dir.path(),
            "events.csv",
            "Event_Date,Avg_Price,City\n2019-05-01,110.92,Chicago\n2019-06-01,127.24,Boston\n",
        );
        let inspector = SchemaInspector::new(FileLoader::new(1 << 20));
        let schema = inspector.inspect_file(dir.path(), &file).unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(schema.columns[0].inferred_type, ColumnType::Date);
        assert_eq!(schema.columns[1].inferred_type, ColumnType::Real);
        assert_eq!(schema.columns[1].sample_values[0], "110.92");
        assert!(schema
            .semantic_hints
            .iter()
            .any(|(col, _)| col == "Avg_Price"));
    }

    #[test]
    fn correspondences_group_by_concept() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.csv", "Ticket_Cost\n10\n");
        let b = write_file(dir.path(), "b.csv", "revenue,wingspan\n500,12\n");
        let inspector = SchemaInspector::new(FileLoader::new(1 << 20));
        let schemas = vec![
            inspector.inspect_file(dir.path(), &a).unwrap(),
            inspector.inspect_file(dir.path(), &b).unwrap(),
        ];
        let (groups, unmatched) = column_correspondences(&schemas);
        let price = groups.iter().find(|g| g.concept == "price").unwrap();
        assert_eq!(price.columns, vec!["a.csv:Ticket_Cost"]);
        let revenue = groups.iter().find(|g| g.concept == "revenue").unwrap();
        assert_eq!(revenue.columns, vec!["b.csv:revenue"]);
        assert_eq!(unmatched, vec!["b.csv:wingspan"]);
    }

    #[test]
    fn guide_mentions_groups_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.csv", "Price\n10\n");
        let b = write_file(dir.path(), "b.csv", "Amount\n20\n");
        let inspector = SchemaInspector::new(FileLoader::new(1 << 20));
        let schemas = vec![
            inspector.inspect_file(dir.path(), &a).unwrap(),
            inspector.inspect_file(dir.path(), &b).unwrap(),
        ];
        let guide = normalization_guide(&schemas);
        assert!(guide.contains("a.csv"));
        assert!(guide.contains("b.csv"));
        assert!(guide.contains("price: a.csv:Price, b.csv:Amount"));
    }

    #[test]
    fn inspect_dir_reports_failures_alongside_successes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "good.csv", "a\n1\n");
        write_file(dir.path(), "bad.json", "not json at all");
        let inspector = SchemaInspector::new(FileLoader::new(1 << 20));
        let (schemas, failures) = inspector.inspect_dir(dir.path()).unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad.json");
    }
}
