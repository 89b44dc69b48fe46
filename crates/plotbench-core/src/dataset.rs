//! Tabular datasets and test-case rows.
//!
//! A [`Dataset`] is the plotting data bound into a generated script as `df`.
//! Test-case files list one unit per row; a row that cannot be read keeps its
//! slot as [`RowContent::Unreadable`] so the batch never shrinks.
//!
//! Both kinds of file may be CSV or an Excel workbook (`.xls`/`.xlsx`, first
//! sheet, first row as header). Datasets may also be JSON.

use calamine::{open_workbook_auto, Data, Range, Reader};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Column holding the natural-language plotting request.
pub const PROMPT_COLUMN: &str = "prompt";

/// Column holding the path of the plotting data, relative to the test set.
pub const DATA_PATH_COLUMN: &str = "data_path";

/// Rows shown to the generator by default.
pub const DEFAULT_PREVIEW_ROWS: usize = 5;

/// Errors that can occur when reading tabular files.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to read dataset file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse CSV: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to read workbook: {0}")]
    ExcelError(#[from] calamine::Error),

    #[error("Unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed dataset: {0}")]
    Malformed(String),
}

/// A single typed cell.
///
/// Serialises as a bare JSON scalar so the sandbox harness can rebuild the
/// frame without a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Infer a typed cell from raw text.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Empty;
        }

        if trimmed.eq_ignore_ascii_case("true") {
            return Cell::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Cell::Bool(false);
        }

        if let Ok(value) = trimmed.parse::<i64>() {
            return Cell::Int(value);
        }

        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Cell::Float(value),
            _ => Cell::Text(raw.to_string()),
        }
    }

    /// Text content, if this is a text cell.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::Bool(b) => Cell::Bool(*b),
            Data::Int(i) => Cell::Int(*i),
            // Spreadsheets store every number as a float
            Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Cell::Int(*f as i64),
            Data::Float(f) => Cell::Float(*f),
            Data::String(text) if text.trim().is_empty() => Cell::Empty,
            Data::String(text) => Cell::Text(text.clone()),
            other => Cell::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => write!(f, "NaN"),
            Cell::Bool(true) => write!(f, "True"),
            Cell::Bool(false) => write!(f, "False"),
            Cell::Int(value) => write!(f, "{}", value),
            // Whole floats keep one decimal so they read as floats in previews.
            Cell::Float(value) if value.fract() == 0.0 && value.abs() < 1e16 => {
                write!(f, "{:.1}", value)
            }
            Cell::Float(value) => write!(f, "{}", value),
            Cell::Text(text) => write!(f, "{}", text),
        }
    }
}

/// On-disk dataset formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    Json,
    Excel,
}

impl DatasetFormat {
    /// Pick a format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, DatasetError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" => Ok(DatasetFormat::Csv),
            "json" => Ok(DatasetFormat::Json),
            "xls" | "xlsx" => Ok(DatasetFormat::Excel),
            "" => Err(DatasetError::UnsupportedFormat(format!(
                "'{}' has no file extension",
                path.display()
            ))),
            other => Err(DatasetError::UnsupportedFormat(format!(
                "'.{}' files are not supported (expected .csv, .json, .xls or .xlsx)",
                other
            ))),
        }
    }
}

/// Ordered columns plus rows of typed cells.
///
/// Every row has exactly one cell per column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonDataset {
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    },
    Records(Vec<OrderedRecord>),
}

/// A JSON object with its keys in document order.
struct OrderedRecord(Vec<(String, Cell)>);

impl OrderedRecord {
    fn get(&self, key: &str) -> Option<&Cell> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl<'de> Deserialize<'de> for OrderedRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = OrderedRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, Cell>()? {
                    entries.push(entry);
                }
                Ok(OrderedRecord(entries))
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

impl Dataset {
    /// Build a dataset, checking that every row matches the column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, DatasetError> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(DatasetError::Malformed(format!(
                "row {} has {} cells but there are {} columns",
                i,
                row.len(),
                columns.len()
            )));
        }

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parse text in the given format.
    pub fn parse(format: DatasetFormat, text: &str) -> Result<Self, DatasetError> {
        match format {
            DatasetFormat::Csv => Self::from_csv_str(text),
            DatasetFormat::Json => Self::from_json_str(text),
            DatasetFormat::Excel => Err(DatasetError::UnsupportedFormat(
                "Excel workbooks are binary and must be loaded from a file".to_string(),
            )),
        }
    }

    /// Parse CSV with the first row as header.
    pub fn from_csv_str(text: &str) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(Cell::infer).collect());
        }

        Self::new(columns, rows)
    }

    /// Parse JSON, either `{"columns": [...], "rows": [[...]]}` or an array
    /// of records. Record keys become columns in the order they first appear.
    pub fn from_json_str(text: &str) -> Result<Self, DatasetError> {
        match serde_json::from_str::<JsonDataset>(text)? {
            JsonDataset::Table { columns, rows } => Self::new(columns, rows),
            JsonDataset::Records(records) => {
                let mut seen = HashSet::new();
                let columns: Vec<String> = records
                    .iter()
                    .flat_map(|r| r.0.iter().map(|(k, _)| k))
                    .filter(|k| seen.insert(k.as_str()))
                    .cloned()
                    .collect();

                let rows = records
                    .iter()
                    .map(|record| {
                        columns
                            .iter()
                            .map(|c| record.get(c).cloned().unwrap_or(Cell::Empty))
                            .collect()
                    })
                    .collect();

                Self::new(columns, rows)
            }
        }
    }

    /// Build a dataset from a worksheet whose first row is the header.
    pub fn from_sheet(sheet: &Range<Data>) -> Result<Self, DatasetError> {
        let mut rows = sheet.rows();
        let columns = rows.next().map(sheet_header).unwrap_or_default();
        let rows = rows
            .map(|row| row.iter().map(Cell::from).collect())
            .collect();

        Self::new(columns, rows)
    }

    /// Read and parse a dataset file, dispatching on its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        match DatasetFormat::from_path(path)? {
            DatasetFormat::Excel => Self::from_sheet(&first_sheet(path)?),
            format => {
                let text = fs::read_to_string(path)?;
                Self::parse(format, &text)
            }
        }
    }

    /// Render the first `max_rows` rows as an index-free, right-aligned table.
    pub fn preview(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return "Empty DataFrame".to_string();
        }

        let shown = &self.rows[..self.rows.len().min(max_rows)];
        let rendered: Vec<Vec<String>> = shown
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect();

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                rendered
                    .iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut lines = Vec::with_capacity(rendered.len() + 1);
        lines.push(format_line(&self.columns, &widths));
        for row in &rendered {
            lines.push(format_line(row, &widths));
        }
        lines.join("\n")
    }
}

fn first_sheet(path: &Path) -> Result<Range<Data>, DatasetError> {
    let mut workbook = open_workbook_auto(path)?;
    match workbook.worksheet_range_at(0) {
        Some(sheet) => Ok(sheet?),
        None => Err(DatasetError::Malformed(format!(
            "'{}' has no worksheets",
            path.display()
        ))),
    }
}

fn sheet_header(row: &[Data]) -> Vec<String> {
    row.iter().map(|c| c.to_string().trim().to_string()).collect()
}

fn format_line<S: AsRef<str>>(cells: &[S], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:>width$}", cell.as_ref(), width = *width))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One row of a test-case file.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseRow {
    /// Zero-based position in the test-case file
    pub index: usize,

    pub content: RowContent,
}

/// What could be read from a test-case row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowContent {
    Fields(BTreeMap<String, Cell>),
    Unreadable(String),
}

impl TestCaseRow {
    pub fn fields(index: usize, fields: BTreeMap<String, Cell>) -> Self {
        Self {
            index,
            content: RowContent::Fields(fields),
        }
    }

    pub fn unreadable(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            content: RowContent::Unreadable(reason.into()),
        }
    }

    /// Convenience constructor for a well-formed row.
    pub fn new(index: usize, prompt: impl Into<String>, data_path: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(PROMPT_COLUMN.to_string(), Cell::Text(prompt.into()));
        fields.insert(DATA_PATH_COLUMN.to_string(), Cell::Text(data_path.into()));
        Self::fields(index, fields)
    }

    /// Look up a column. `None` if the column is absent or the row unreadable.
    pub fn field(&self, name: &str) -> Option<&Cell> {
        match &self.content {
            RowContent::Fields(fields) => fields.get(name),
            RowContent::Unreadable(_) => None,
        }
    }
}

/// Parse a test-case CSV (first row is the header).
///
/// Returns one [`TestCaseRow`] per data record, in file order. Only a failure
/// to read the file as a whole is an error.
pub fn parse_test_cases(bytes: &[u8]) -> Result<Vec<TestCaseRow>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.byte_records().enumerate() {
        let row = match record {
            Ok(record) => read_test_case(index, &headers, &record),
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(row = index, error = %e, "Unreadable test-case row");
                TestCaseRow::unreadable(index, e.to_string())
            }
        };
        rows.push(row);
    }

    Ok(rows)
}

/// Read test cases from the first sheet of a workbook.
///
/// Sheets are rectangular, so every row is readable; blank cells are
/// [`Cell::Empty`].
pub fn test_cases_from_sheet(sheet: &Range<Data>) -> Vec<TestCaseRow> {
    let mut rows = sheet.rows();
    let headers = rows.next().map(sheet_header).unwrap_or_default();

    rows.enumerate()
        .map(|(index, row)| {
            let fields = headers
                .iter()
                .cloned()
                .zip(row.iter().map(Cell::from))
                .collect();
            TestCaseRow::fields(index, fields)
        })
        .collect()
}

/// Read a test-case file from disk: a workbook for `.xls`/`.xlsx`, CSV
/// otherwise.
pub fn load_test_cases(path: impl AsRef<Path>) -> Result<Vec<TestCaseRow>, DatasetError> {
    let path = path.as_ref();
    if let Ok(DatasetFormat::Excel) = DatasetFormat::from_path(path) {
        return Ok(test_cases_from_sheet(&first_sheet(path)?));
    }
    let bytes = fs::read(path)?;
    parse_test_cases(&bytes)
}

fn read_test_case(index: usize, headers: &[String], record: &csv::ByteRecord) -> TestCaseRow {
    if record.len() != headers.len() {
        return TestCaseRow::unreadable(
            index,
            format!(
                "expected {} fields, found {}",
                headers.len(),
                record.len()
            ),
        );
    }

    let mut fields = BTreeMap::new();
    for (name, raw) in headers.iter().zip(record.iter()) {
        match std::str::from_utf8(raw) {
            Ok(text) => {
                fields.insert(name.clone(), Cell::infer(text));
            }
            Err(e) => {
                return TestCaseRow::unreadable(
                    index,
                    format!("column '{}' is not valid UTF-8: {}", name, e),
                );
            }
        }
    }

    TestCaseRow::fields(index, fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_inference() {
        assert_eq!(Cell::infer(""), Cell::Empty);
        assert_eq!(Cell::infer("  "), Cell::Empty);
        assert_eq!(Cell::infer("TRUE"), Cell::Bool(true));
        assert_eq!(Cell::infer("42"), Cell::Int(42));
        assert_eq!(Cell::infer("-3.5"), Cell::Float(-3.5));
        assert_eq!(Cell::infer("control"), Cell::Text("control".to_string()));
        assert_eq!(Cell::infer("inf"), Cell::Text("inf".to_string()));
    }

    #[test]
    fn test_cell_serializes_as_scalar() {
        let cells = vec![
            Cell::Empty,
            Cell::Bool(false),
            Cell::Int(7),
            Cell::Float(1.5),
            Cell::Text("a".to_string()),
        ];
        let json = serde_json::to_string(&cells).unwrap();
        assert_eq!(json, r#"[null,false,7,1.5,"a"]"#);

        let back: Vec<Cell> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cells);
    }

    #[test]
    fn test_csv_dataset_keeps_column_order() {
        let ds = Dataset::from_csv_str("group,value\nA,1.0\nB,2.5\n").unwrap();
        assert_eq!(ds.columns(), &["group".to_string(), "value".to_string()]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows()[1][1], Cell::Float(2.5));
    }

    #[test]
    fn test_csv_ragged_rows_rejected() {
        let result = Dataset::from_csv_str("a,b\n1,2\n3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_table_and_records() {
        let table = Dataset::from_json_str(r#"{"columns":["x","y"],"rows":[[1,2.5],[2,null]]}"#)
            .unwrap();
        assert_eq!(table.rows()[1][1], Cell::Empty);

        let records = Dataset::from_json_str(r#"[{"y":1,"x":"a"},{"x":"b","z":true}]"#).unwrap();
        assert_eq!(
            records.columns(),
            &["y".to_string(), "x".to_string(), "z".to_string()]
        );
        assert_eq!(records.rows()[0], vec![Cell::Int(1), Cell::Text("a".into()), Cell::Empty]);
        assert_eq!(records.rows()[1][0], Cell::Empty);
    }

    #[test]
    fn test_json_table_width_mismatch() {
        let result = Dataset::from_json_str(r#"{"columns":["x","y"],"rows":[[1]]}"#);
        assert!(matches!(result, Err(DatasetError::Malformed(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            DatasetFormat::from_path(Path::new("data/a.CSV")).unwrap(),
            DatasetFormat::Csv
        );
        assert_eq!(
            DatasetFormat::from_path(Path::new("testset/release_v2.xls")).unwrap(),
            DatasetFormat::Excel
        );
        assert_eq!(
            DatasetFormat::from_path(Path::new("data/a.xlsx")).unwrap(),
            DatasetFormat::Excel
        );
        assert!(matches!(
            DatasetFormat::from_path(Path::new("data/a.parquet")),
            Err(DatasetError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            Dataset::parse(DatasetFormat::Excel, "a,b"),
            Err(DatasetError::UnsupportedFormat(_))
        ));
    }

    fn sheet(cells: Vec<Vec<Data>>) -> Range<Data> {
        let height = cells.len() as u32;
        let width = cells[0].len() as u32;
        let mut range = Range::new((0, 0), (height - 1, width - 1));
        for (r, row) in cells.into_iter().enumerate() {
            for (c, cell) in row.into_iter().enumerate() {
                range.set_value((r as u32, c as u32), cell);
            }
        }
        range
    }

    #[test]
    fn test_sheet_dataset() {
        let ds = Dataset::from_sheet(&sheet(vec![
            vec![Data::String("group ".into()), Data::String("value".into())],
            vec![Data::String("control".into()), Data::Float(1.0)],
            vec![Data::String("treated".into()), Data::Float(2.5)],
            vec![Data::Empty, Data::Int(3)],
        ]))
        .unwrap();

        assert_eq!(ds.columns(), &["group".to_string(), "value".to_string()]);
        assert_eq!(ds.rows()[0], vec![Cell::Text("control".into()), Cell::Int(1)]);
        assert_eq!(ds.rows()[1][1], Cell::Float(2.5));
        assert_eq!(ds.rows()[2], vec![Cell::Empty, Cell::Int(3)]);
    }

    #[test]
    fn test_sheet_test_cases() {
        let rows = test_cases_from_sheet(&sheet(vec![
            vec![Data::String("prompt".into()), Data::String("data_path".into())],
            vec![Data::String("bar plot".into()), Data::String("data/a.xlsx".into())],
            vec![Data::String("  ".into()), Data::String("data/b.csv".into())],
        ]));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 0);
        assert_eq!(rows[0].field(PROMPT_COLUMN), Some(&Cell::Text("bar plot".into())));
        assert_eq!(rows[1].field(PROMPT_COLUMN), Some(&Cell::Empty));
        assert_eq!(rows[1].field(DATA_PATH_COLUMN), Some(&Cell::Text("data/b.csv".into())));
    }

    #[test]
    fn test_corrupt_workbook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release_v2.xlsx");
        fs::write(&path, "prompt,data_path\n").unwrap();

        assert!(matches!(load_test_cases(&path), Err(DatasetError::ExcelError(_))));
        assert!(matches!(Dataset::load(&path), Err(DatasetError::ExcelError(_))));
    }

    #[test]
    fn test_preview_is_right_aligned_and_truncated() {
        let mut csv = String::from("group,value\n");
        for i in 0..8 {
            csv.push_str(&format!("g{},{}\n", i, i * 10));
        }
        let ds = Dataset::from_csv_str(&csv).unwrap();
        let preview = ds.preview(DEFAULT_PREVIEW_ROWS);
        let lines: Vec<&str> = preview.lines().collect();

        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "group value");
        assert_eq!(lines[1], "   g0     0");
        assert_eq!(lines[5], "   g4    40");
    }

    #[test]
    fn test_preview_float_formatting() {
        let ds = Dataset::from_csv_str("v\n2.0\n0.25\n").unwrap();
        assert_eq!(ds.preview(5), "   v\n 2.0\n0.25");
    }

    #[test]
    fn test_test_cases_keep_unreadable_slots() {
        let csv = "prompt,data_path\nbar plot,a.csv\nbroken\nline plot,b.csv\n";
        let rows = parse_test_cases(csv.as_bytes()).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].field(PROMPT_COLUMN), Some(&Cell::Text("bar plot".into())));
        assert!(matches!(rows[1].content, RowContent::Unreadable(_)));
        assert_eq!(rows[1].index, 1);
        assert_eq!(rows[2].field(DATA_PATH_COLUMN), Some(&Cell::Text("b.csv".into())));
    }

    #[test]
    fn test_test_cases_invalid_utf8_row() {
        let mut bytes = b"prompt,data_path\n".to_vec();
        bytes.extend_from_slice(b"ok,a.csv\n");
        bytes.extend_from_slice(&[0xff, 0xfe, b',', b'b', b'\n']);
        let rows = parse_test_cases(&bytes).unwrap();

        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[1].content, RowContent::Unreadable(_)));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "a,b\n1,x\n").unwrap();

        let ds = Dataset::load(&path).unwrap();
        assert_eq!(ds.rows()[0], vec![Cell::Int(1), Cell::Text("x".into())]);
    }
}
