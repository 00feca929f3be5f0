// backend/tests/loader_tests.rs
//
// Format auto-detection and cross-format equivalence for the file loader.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tabula_backend::loader::{ColumnType, FileLoader, Frame, LoaderError};

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

fn loader() -> FileLoader {
    FileLoader::new(10 * 1024 * 1024)
}

fn rendered(frame: &Frame) -> Vec<Vec<String>> {
    frame
        .rows
        .iter()
        .map(|row| row.iter().map(|c| c.render()).collect())
        .collect()
}

// --- JSON structure sniffing -------------------------------------------------

#[test]
fn json_three_forms_agree() {
    let dir = tempfile::tempdir().unwrap();
    let array = write_file(
        dir.path(),
        "array.json",
        r#"[{"city": "Chicago", "revenue": 500}, {"city": "Boston", "revenue": 1500}]"#,
    );
    let wrapped = write_file(
        dir.path(),
        "wrapped.json",
        r#"{"data": [{"city": "Chicago", "revenue": 500}, {"city": "Boston", "revenue": 1500}]}"#,
    );
    let ndjson = write_file(
        dir.path(),
        "lines.json",
        "{\"city\": \"Chicago\", \"revenue\": 500}\n{\"city\": \"Boston\", \"revenue\": 1500}\n",
    );

    let frames: Vec<Frame> = [array, wrapped, ndjson]
        .iter()
        .map(|p| loader().load(p).unwrap())
        .collect();

    for frame in &frames {
        assert_eq!(frame.columns, vec!["city", "revenue"]);
        assert_eq!(frame.row_count(), 2);
    }
    assert_eq!(rendered(&frames[0]), rendered(&frames[1]));
    assert_eq!(rendered(&frames[0]), rendered(&frames[2]));
}

// --- TXT delimiter election --------------------------------------------------

#[test]
fn txt_delimiter_detection_for_each_candidate() {
    let dir = tempfile::tempdir().unwrap();
    for (name, delimiter) in [
        ("comma.txt", ","),
        ("tab.txt", "\t"),
        ("pipe.txt", "|"),
        ("semi.txt", ";"),
    ] {
        let content = format!(
            "a{d}b{d}c\n1{d}2{d}3\n4{d}5{d}6\n",
            d = delimiter
        );
        let path = write_file(dir.path(), name, &content);
        let frame = loader().load(&path).unwrap();
        assert_eq!(frame.columns, vec!["a", "b", "c"], "delimiter {delimiter:?}");
        assert_eq!(frame.row_count(), 2, "delimiter {delimiter:?}");
        assert_eq!(frame.rows[0][0].render(), "1");
    }
}

#[test]
fn txt_without_delimiter_degrades_to_single_column() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "plain.txt", "notes\nfirst line\nsecond line\n");
    let frame = loader().load(&path).unwrap();
    assert_eq!(frame.columns, vec!["notes"]);
    assert_eq!(frame.row_count(), 2);
    assert_eq!(frame.rows[1][0].render(), "second line");
}

// --- Cross-format equivalence ------------------------------------------------

/// The same table expressed as CSV, TSV, JSON, and XLSX must come out with
/// identical column order, row order, and per-cell stringified values.
#[test]
fn loader_equivalence_across_formats() {
    let dir = tempfile::tempdir().unwrap();

    let csv = write_file(
        dir.path(),
        "t.csv",
        "Event,Avg_Price,Attendance\nOpener,110.92,1000\nFinale,127.24,\nMatinee,101.71,850\n",
    );
    let tsv = write_file(
        dir.path(),
        "t.tsv",
        "Event\tAvg_Price\tAttendance\nOpener\t110.92\t1000\nFinale\t127.24\t\nMatinee\t101.71\t850\n",
    );
    let json = write_file(
        dir.path(),
        "t.json",
        r#"[
            {"Event": "Opener", "Avg_Price": 110.92, "Attendance": 1000},
            {"Event": "Finale", "Avg_Price": 127.24, "Attendance": null},
            {"Event": "Matinee", "Avg_Price": 101.71, "Attendance": 850}
        ]"#,
    );

    let xlsx_path = dir.path().join("t.xlsx");
    {
        use rust_xlsxwriter::Workbook;
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, header) in ["Event", "Avg_Price", "Attendance"].iter().enumerate() {
            sheet.write_string(0, col as u16, *header).unwrap();
        }
        let rows: [(&str, f64, Option<f64>); 3] = [
            ("Opener", 110.92, Some(1000.0)),
            ("Finale", 127.24, None),
            ("Matinee", 101.71, Some(850.0)),
        ];
        for (i, (event, price, attendance)) in rows.iter().enumerate() {
            let r = (i + 1) as u32;
            sheet.write_string(r, 0, *event).unwrap();
            sheet.write_number(r, 1, *price).unwrap();
            if let Some(a) = attendance {
                sheet.write_number(r, 2, *a).unwrap();
            }
        }
        workbook.save(&xlsx_path).unwrap();
    }

    let frames: Vec<Frame> = [csv, tsv, json, xlsx_path]
        .iter()
        .map(|p| loader().load(p).unwrap())
        .collect();

    let reference = rendered(&frames[0]);
    assert_eq!(reference[1][2], "", "null renders as the empty sentinel");
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(
            frame.columns,
            vec!["Event", "Avg_Price", "Attendance"],
            "format #{i}"
        );
        assert_eq!(rendered(frame), reference, "format #{i}");
        assert_eq!(
            frame.types,
            vec![ColumnType::Text, ColumnType::Real, ColumnType::Integer],
            "format #{i}"
        );
    }
}

// --- Error surface -----------------------------------------------------------

#[test]
fn malformed_csv_reports_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "ragged.csv", "a,b\n1,2,3,4\n");
    let err = loader().load(&path).unwrap_err();
    assert!(matches!(err, LoaderError::MalformedCsv(_)));
}

#[test]
fn malformed_json_reports_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "broken.json", "{\"a\": [1, 2");
    let err = loader().load(&path).unwrap_err();
    assert!(matches!(err, LoaderError::MalformedJson(_)));
}

#[test]
fn malformed_excel_reports_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "fake.xlsx", "this is not a zip archive");
    let err = loader().load(&path).unwrap_err();
    assert!(matches!(err, LoaderError::MalformedExcel(_)));
}

#[test]
fn csv_preserves_column_names_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "names.csv", "Avg_Price,CITY name,x-1\n1,2,3\n");
    let frame = loader().load(&path).unwrap();
    assert_eq!(frame.columns, vec!["Avg_Price", "CITY name", "x-1"]);
}
