// backend/src/prompt_builder.rs
//
// Assembles the system and user prompts for an analysis job. The user
// prompt always carries: the question, the primary-file hint, the file
// listing, the schema summary with semantic hints, the normalization guide
// when several files exist, and the inflation summary when the question
// calls for it.

use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;

use crate::models::files::DataFile;
use crate::services::schema_inspector::{self, Schema};

/// Question phrasings that call for inflation context.
const INFLATION_KEYWORDS: [&str; 8] = [
    "inflation",
    "adjust",
    "adjusted",
    "purchasing power",
    "real terms",
    "today's dollars",
    "present value",
    "worth now",
];

static YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("year pattern is valid"));

pub fn build_system_prompt() -> String {
    "You are a data analyst working against tabular files. Answer the user's \
     question by writing Python code, one fenced code block per reply.\n\
     \n\
     Rules:\n\
     - Load every data file by running the loader shim, never an ad-hoc \
     parser: `subprocess.run(['tabula-load', '<filename>'], ...)` prints the \
     file as normalized CSV on stdout, with one uniform empty-string \
     encoding for missing values. Parse that CSV output.\n\
     - Print intermediate results; whatever your code prints is returned to \
     you as an observation before your next reply.\n\
     - If your code raises an error you will see the traceback; correct the \
     code and try again.\n\
     - When you have the final answer, reply with plain text only and no \
     code block. That text is returned to the user verbatim, so state the \
     answer with its numeric value.\n"
        .to_string()
}

pub struct PromptContext<'a> {
    pub question: &'a str,
    pub primary_file: Option<&'a str>,
    pub files: &'a [DataFile],
    pub schemas: &'a [Schema],
    pub schema_failures: &'a [(String, String)],
    pub inflation_summary: Option<&'a str>,
}

pub fn build_user_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    writeln!(prompt, "User question: \"{}\"\n", ctx.question)
        .expect("writing to String cannot fail");

    if let Some(primary) = ctx.primary_file {
        writeln!(
            prompt,
            "The user pointed at '{primary}' as the primary file; other files \
             are available if the question needs them.\n"
        )
        .expect("writing to String cannot fail");
    }

    prompt.push_str("Available data files:\n");
    prompt.push_str(&schema_inspector::file_listing(ctx.files));
    prompt.push('\n');

    prompt.push('\n');
    prompt.push_str(&schema_inspector::schema_summary(ctx.schemas));

    for (file, error) in ctx.schema_failures {
        writeln!(
            prompt,
            "Note: {file} could not be inspected ({error}); load it directly if needed."
        )
        .expect("writing to String cannot fail");
    }

    if ctx.schemas.len() >= 2 {
        prompt.push('\n');
        prompt.push_str(&schema_inspector::normalization_guide(ctx.schemas));
    }

    if let Some(inflation) = ctx.inflation_summary {
        prompt.push('\n');
        prompt.push_str(inflation);
    }

    prompt.push_str("\nWrite the first code block now.\n");
    prompt
}

/// Decide whether the question wants inflation context, and over which year
/// span. Needs an inflation-flavored phrase plus at least one year; a lone
/// year spans to the current year.
pub fn detect_inflation_span(question: &str) -> Option<(i32, i32)> {
    let lowered = question.to_lowercase();
    if !INFLATION_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return None;
    }
    let mut years: Vec<i32> = YEAR
        .find_iter(question)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    years.sort_unstable();
    years.dedup();
    match years.as_slice() {
        [] => None,
        [only] => Some((*only, Utc::now().year())),
        [first, .., last] => Some((*first, *last)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FileLoader;
    use crate::models::files::FileFormat;
    use crate::services::schema_inspector::SchemaInspector;
    use chrono::Utc;
    use std::io::Write as _;

    #[test]
    fn inflation_span_from_two_years() {
        let span = detect_inflation_span("a $119.85 price in 2019 adjusted to 2026");
        assert_eq!(span, Some((2019, 2026)));
    }

    #[test]
    fn inflation_span_needs_keyword() {
        assert_eq!(detect_inflation_span("average price in 2019"), None);
    }

    #[test]
    fn single_year_spans_to_now() {
        let span = detect_inflation_span("what is 2019 revenue in today's dollars").unwrap();
        assert_eq!(span.0, 2019);
        assert_eq!(span.1, Utc::now().year());
    }

    #[test]
    fn prompt_carries_all_content_categories() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("prices.csv", "Avg_Price\n110.92\n127.24\n"),
            ("sales.csv", "revenue\n500\n1500\n"),
        ] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(content.as_bytes()).unwrap();
        }
        let files: Vec<DataFile> = crate::models::files::list_data_files(dir.path()).unwrap();
        let inspector = SchemaInspector::new(FileLoader::new(1 << 20));
        let (schemas, _) = inspector.inspect_dir(dir.path()).unwrap();

        let ctx = PromptContext {
            question: "what is the median Avg_Price?",
            primary_file: Some("prices.csv"),
            files: &files,
            schemas: &schemas,
            schema_failures: &[],
            inflation_summary: Some("US inflation from 2019 to 2026:"),
        };
        let prompt = build_user_prompt(&ctx);
        assert!(prompt.contains("median Avg_Price"));
        assert!(prompt.contains("primary file"));
        assert!(prompt.contains("prices.csv"));
        assert!(prompt.contains("sales.csv"));
        assert!(prompt.contains("DATA SCHEMA ANALYSIS"));
        assert!(prompt.contains("DATA NORMALIZATION GUIDE"));
        assert!(prompt.contains("US inflation"));
    }

    #[test]
    fn system_prompt_routes_loading_through_the_shim() {
        let system = build_system_prompt();
        assert!(system.contains("tabula-load"));
        assert!(system.contains("plain text only"));
    }

    #[test]
    fn format_listing_is_informative() {
        let files = vec![DataFile {
            name: "a.csv".to_string(),
            size: 2048,
            mtime: Utc::now(),
            format: FileFormat::Csv,
        }];
        let listing = schema_inspector::file_listing(&files);
        assert_eq!(listing, "a.csv (csv, 2.00 KB)");
    }
}
