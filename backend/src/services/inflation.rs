// backend/src/services/inflation.rs
//
// Persistent historical-inflation reference table with conditional refresh.
// The table is a single JSON document replaced atomically via rename; a
// failed fetch or parse never touches good data on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Month column headers as they appear in the source table and in the
/// persisted document.
pub const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Assumed annual rate for years absent from the table.
pub const DEFAULT_ASSUMED_ANNUAL_RATE: f64 = 3.0;

pub type YearRates = BTreeMap<String, f64>;

#[derive(Error, Debug)]
pub enum InflationError {
    #[error("inflation source fetch failed: {0}")]
    Fetch(String),

    #[error("inflation source parse failed: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache file is corrupt: {0}")]
    Corrupt(String),
}

/// The persisted document. Years are string keys for stability; missing
/// months within a year are omitted rather than nulled.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    source: Option<String>,
    data: BTreeMap<String, YearRates>,
}

/// In-memory inflation table.
#[derive(Debug, Clone, PartialEq)]
pub struct InflationTable {
    pub fetched_at: Option<DateTime<Utc>>,
    pub source_identifier: Option<String>,
    pub rows: BTreeMap<i32, YearRates>,
}

impl InflationTable {
    pub fn empty() -> Self {
        Self {
            fetched_at: None,
            source_identifier: None,
            rows: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Mean of the available monthly percentages for a year; `None` when no
    /// months are present.
    pub fn annual_rate(&self, year: i32) -> Option<f64> {
        let months = self.rows.get(&year)?;
        if months.is_empty() {
            return None;
        }
        Some(months.values().sum::<f64>() / months.len() as f64)
    }

    /// Compounded inflation over `[start_year, end_year)` as a unitless
    /// multiplier minus one. Years without data contribute `assumed_rate`.
    pub fn cumulative_with_default(
        &self,
        start_year: i32,
        end_year: i32,
        assumed_rate: f64,
    ) -> f64 {
        let mut cumulative = 1.0;
        for year in start_year..end_year {
            let rate = self.annual_rate(year).unwrap_or(assumed_rate);
            cumulative *= 1.0 + rate / 100.0;
        }
        cumulative - 1.0
    }

    pub fn cumulative(&self, start_year: i32, end_year: i32) -> f64 {
        self.cumulative_with_default(start_year, end_year, DEFAULT_ASSUMED_ANNUAL_RATE)
    }

    /// Human-readable block suitable for injection into a model prompt.
    pub fn summary(&self, start_year: i32, end_year: i32) -> String {
        use std::fmt::Write as _;

        if self.is_empty() {
            return format!(
                "No inflation data available; assume a {DEFAULT_ASSUMED_ANNUAL_RATE:.0}% annual rate."
            );
        }

        let cumulative = self.cumulative(start_year, end_year);
        let mut out = format!("US inflation from {start_year} to {end_year}:\n");
        writeln!(out, "Cumulative rate: {:.2}%", cumulative * 100.0)
            .expect("writing to String cannot fail");
        if let Some(source) = &self.source_identifier {
            writeln!(out, "Source: {source} (cached)").expect("writing to String cannot fail");
        }
        out.push_str("Yearly breakdown (average of monthly rates):\n");
        for year in start_year..end_year {
            match self.annual_rate(year) {
                Some(rate) => writeln!(out, "  {year}: {rate:.2}%"),
                None => writeln!(
                    out,
                    "  {year}: no data, {DEFAULT_ASSUMED_ANNUAL_RATE:.0}% assumed"
                ),
            }
            .expect("writing to String cannot fail");
        }
        out
    }
}

/// A table read, carrying whether a wanted refresh could not be performed.
#[derive(Debug, Clone)]
pub struct InflationSnapshot {
    pub table: InflationTable,
    pub stale: bool,
}

pub struct InflationCache {
    path: PathBuf,
    source_url: String,
    max_age_days: i64,
    http: reqwest::Client,
}

impl InflationCache {
    pub fn new(
        path: impl Into<PathBuf>,
        source_url: impl Into<String>,
        max_age_days: i64,
        fetch_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            path: path.into(),
            source_url: source_url.into(),
            max_age_days,
            http,
        }
    }

    /// Read the persisted table; empty when the file is absent.
    pub fn load(&self) -> Result<InflationTable, InflationError> {
        if !self.path.exists() {
            return Ok(InflationTable::empty());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let doc: CacheDocument =
            serde_json::from_str(&content).map_err(|e| InflationError::Corrupt(e.to_string()))?;
        let mut rows = BTreeMap::new();
        for (year, months) in doc.data {
            match year.parse::<i32>() {
                Ok(y) => {
                    rows.insert(y, months);
                }
                Err(_) => {
                    warn!(year = %year, "Skipping non-numeric year key in inflation cache");
                }
            }
        }
        Ok(InflationTable {
            fetched_at: Some(doc.fetched_at),
            source_identifier: doc.source,
            rows,
        })
    }

    /// Whether the persisted table warrants a refresh: missing, older than
    /// the max age, or fetched in a different calendar year.
    pub fn needs_refresh(&self, table: &InflationTable, now: DateTime<Utc>) -> bool {
        let Some(fetched_at) = table.fetched_at else {
            return true;
        };
        if table.is_empty() {
            return true;
        }
        let age_days = (now - fetched_at).num_days();
        age_days > self.max_age_days || fetched_at.year() != now.year()
    }

    /// Return a fresh table, refreshing from the source when the policy asks
    /// for it (or unconditionally with `force`). Fetch or parse failures are
    /// never fatal: the previously cached table comes back marked stale.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn refresh(&self, force: bool) -> InflationSnapshot {
        let cached = match self.load() {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, "Failed to load inflation cache; starting empty");
                InflationTable::empty()
            }
        };

        if !force && !self.needs_refresh(&cached, Utc::now()) {
            return InflationSnapshot {
                table: cached,
                stale: false,
            };
        }

        match self.fetch_and_parse().await {
            Ok(fetched_rows) => {
                let mut merged = cached.rows.clone();
                merge_rows(&mut merged, fetched_rows);
                let table = InflationTable {
                    fetched_at: Some(Utc::now()),
                    source_identifier: Some(self.source_url.clone()),
                    rows: merged,
                };
                if let Err(err) = self.persist(&table) {
                    warn!(error = %err, "Failed to persist refreshed inflation table");
                }
                info!(years = table.rows.len(), "Refreshed inflation table");
                InflationSnapshot {
                    table,
                    stale: false,
                }
            }
            Err(err) => {
                warn!(error = %err, "Inflation refresh failed; serving cached table");
                InflationSnapshot {
                    table: cached,
                    stale: true,
                }
            }
        }
    }

    async fn fetch_and_parse(&self) -> Result<BTreeMap<i32, YearRates>, InflationError> {
        let response = self
            .http
            .get(&self.source_url)
            .send()
            .await
            .map_err(|e| InflationError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| InflationError::Fetch(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| InflationError::Fetch(e.to_string()))?;
        parse_inflation_html(&body)
    }

    /// Write-temp-then-rename so concurrent readers always see a full
    /// document.
    fn persist(&self, table: &InflationTable) -> Result<(), InflationError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = CacheDocument {
            fetched_at: table.fetched_at.unwrap_or_else(Utc::now),
            source: table.source_identifier.clone(),
            data: table
                .rows
                .iter()
                .map(|(year, months)| (year.to_string(), months.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| InflationError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Month-level merge: fetched values overwrite, everything already present
/// survives. The table never shrinks across refreshes.
fn merge_rows(existing: &mut BTreeMap<i32, YearRates>, fetched: BTreeMap<i32, YearRates>) {
    for (year, months) in fetched {
        let entry = existing.entry(year).or_default();
        for (month, rate) in months {
            entry.insert(month, rate);
        }
    }
}

/// Extract `{year -> {month -> percentage}}` from the source page's first
/// table. The header row names the months; each data row starts with a year.
pub fn parse_inflation_html(html: &str) -> Result<BTreeMap<i32, YearRates>, InflationError> {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").expect("static selector is valid");
    let row_sel = Selector::parse("tr").expect("static selector is valid");
    let cell_sel = Selector::parse("th, td").expect("static selector is valid");

    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| InflationError::Parse("no table found on page".to_string()))?;

    let mut rows = table.select(&row_sel);
    let header_row = rows
        .next()
        .ok_or_else(|| InflationError::Parse("table has no rows".to_string()))?;
    let headers: Vec<String> = header_row
        .select(&cell_sel)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect();

    let mut data = BTreeMap::new();
    for row in rows {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 2 {
            continue;
        }
        let Ok(year) = cells[0].parse::<i32>() else {
            continue;
        };
        let mut months = YearRates::new();
        for (i, raw) in cells.iter().enumerate().skip(1) {
            let Some(header) = headers.get(i) else {
                break;
            };
            if !MONTHS.contains(&header.as_str()) {
                continue;
            }
            let cleaned = raw.replace('%', "");
            let cleaned = cleaned.trim();
            if cleaned.is_empty() || cleaned == "-" {
                continue;
            }
            if let Ok(rate) = cleaned.parse::<f64>() {
                months.insert(header.clone(), rate);
            }
        }
        data.insert(year, months);
    }

    if data.is_empty() {
        return Err(InflationError::Parse(
            "no year rows found in table".to_string(),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn table_with(rows: &[(i32, &[(&str, f64)])]) -> InflationTable {
        let mut map = BTreeMap::new();
        for (year, months) in rows {
            let entry: YearRates = months
                .iter()
                .map(|(m, v)| (m.to_string(), *v))
                .collect();
            map.insert(*year, entry);
        }
        InflationTable {
            fetched_at: Some(Utc::now()),
            source_identifier: None,
            rows: map,
        }
    }

    #[test]
    fn annual_rate_is_mean_of_available_months() {
        let table = table_with(&[(2021, &[("Jan", 1.0), ("Feb", 3.0)])]);
        assert_eq!(table.annual_rate(2021), Some(2.0));
        assert_eq!(table.annual_rate(1999), None);
    }

    #[test]
    fn cumulative_assumes_default_for_missing_years() {
        let table = InflationTable::empty();
        let cumulative = table.cumulative_with_default(2020, 2022, 3.0);
        assert!((cumulative - (1.03f64 * 1.03 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn cumulative_matches_price_adjustment_example() {
        let table = table_with(&[
            (2019, &[("Jan", 1.8)]),
            (2020, &[("Jan", 1.2)]),
            (2021, &[("Jan", 4.7)]),
            (2022, &[("Jan", 8.0)]),
            (2023, &[("Jan", 4.1)]),
            (2024, &[("Jan", 2.9)]),
            (2025, &[("Jan", 2.8)]),
        ]);
        let cumulative = table.cumulative(2019, 2026);
        assert!((cumulative * 100.0 - 28.28).abs() < 0.01);
        let adjusted = 119.85 * (1.0 + cumulative);
        assert!((adjusted - 153.74).abs() < 0.01);
    }

    #[test]
    fn needs_refresh_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InflationCache::new(
            dir.path().join("inflation.json"),
            "http://example.invalid/",
            30,
            Duration::from_secs(1),
        );
        let now = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap();

        let empty = InflationTable::empty();
        assert!(cache.needs_refresh(&empty, now));

        let mut fresh = table_with(&[(2025, &[("Jan", 2.0)])]);
        fresh.fetched_at = Some(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        assert!(!cache.needs_refresh(&fresh, now));

        let mut old = fresh.clone();
        old.fetched_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(cache.needs_refresh(&old, now));

        let mut last_year = fresh.clone();
        last_year.fetched_at = Some(Utc.with_ymd_and_hms(2025, 12, 20, 0, 0, 0).unwrap());
        assert!(cache.needs_refresh(&last_year, now));
    }

    #[test]
    fn merge_never_shrinks() {
        let mut existing = table_with(&[
            (2019, &[("Jan", 1.6), ("Feb", 1.5)]),
            (2020, &[("Jan", 2.5)]),
        ])
        .rows;
        let fetched = table_with(&[(2020, &[("Jan", 2.6), ("Feb", 2.3)])]).rows;
        merge_rows(&mut existing, fetched);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[&2019].len(), 2);
        assert_eq!(existing[&2020]["Jan"], 2.6);
        assert_eq!(existing[&2020]["Feb"], 2.3);
    }

    #[test]
    fn parses_source_table_shape() {
        let html = r#"
        <html><body><table>
          <tr><th>Year</th><th>Jan</th><th>Feb</th><th>Ave</th></tr>
          <tr><td>2019</td><td>1.6%</td><td>1.5%</td><td>1.8%</td></tr>
          <tr><td>2020</td><td>2.5</td><td>-</td><td></td></tr>
          <tr><td>Avg</td><td>2.0</td><td>2.0</td><td>2.0</td></tr>
        </table></body></html>"#;
        let data = parse_inflation_html(html).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[&2019]["Jan"], 1.6);
        assert_eq!(data[&2019].get("Ave"), None);
        assert_eq!(data[&2020].len(), 1);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InflationCache::new(
            dir.path().join("inflation.json"),
            "http://example.invalid/",
            30,
            Duration::from_secs(1),
        );
        let table = table_with(&[(2021, &[("Jan", 4.7)])]);
        cache.persist(&table).unwrap();
        let loaded = cache.load().unwrap();
        assert_eq!(loaded.rows, table.rows);
        // String year keys in the document.
        let raw = std::fs::read_to_string(dir.path().join("inflation.json")).unwrap();
        assert!(raw.contains("\"2021\""));
    }
}
