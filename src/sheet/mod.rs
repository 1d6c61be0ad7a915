//! In-memory worksheet model shared by the store and the enrichment engine.
//!
//! A `Sheet` holds sparse cell values keyed by 1-based row number and 0-based
//! column index. Row 1 is the header row. Every write made through
//! [`Sheet::set_text`] is also recorded as an edit so stores can persist only
//! the cells that changed.
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

mod patch;
mod styles;
mod xlsx;

pub use xlsx::XlsxStore;

/// Row number of the header row.
pub const HEADER_ROW: u32 = 1;

/// Scalar cell value as seen by filters and prompts.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    /// Build a text value, normalizing blank text to `Empty`.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value)
        }
    }

    /// Convert a config scalar into a cell value; lists and objects have no cell form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(CellValue::Empty),
            serde_json::Value::Bool(flag) => Some(CellValue::Bool(*flag)),
            serde_json::Value::Number(number) => number.as_f64().map(CellValue::Number),
            serde_json::Value::String(text) => Some(CellValue::text(text.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            CellValue::Number(_) | CellValue::Bool(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Text(text) => f.write_str(text),
            CellValue::Number(number) => {
                if number.fract() == 0.0 && number.abs() < 1e15 {
                    write!(f, "{}", *number as i64)
                } else {
                    write!(f, "{number}")
                }
            }
            CellValue::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

/// Sparse worksheet contents plus the edits made since load.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    name: String,
    rows: BTreeMap<u32, BTreeMap<u32, CellValue>>,
    edits: BTreeMap<u32, BTreeMap<u32, String>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a sheet from dense rows; the first row is the header.
    #[cfg(test)]
    pub fn from_rows(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let mut sheet = Sheet::new(name);
        for (row_idx, row) in rows.into_iter().enumerate() {
            for (col_idx, value) in row.into_iter().enumerate() {
                sheet.insert(row_idx as u32 + 1, col_idx as u32, value);
            }
        }
        sheet
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a loaded value without recording an edit.
    pub(crate) fn insert(&mut self, row: u32, col: u32, value: CellValue) {
        if value == CellValue::Empty {
            return;
        }
        self.rows.entry(row).or_default().insert(col, value);
    }

    pub fn get(&self, row: u32, col: u32) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.rows
            .get(&row)
            .and_then(|cells| cells.get(&col))
            .unwrap_or(&EMPTY)
    }

    /// Last row holding at least one non-blank value.
    pub fn last_row(&self) -> u32 {
        self.rows
            .iter()
            .rev()
            .find(|(_, cells)| cells.values().any(|value| !value.is_blank()))
            .map(|(row, _)| *row)
            .unwrap_or(0)
    }

    /// Number of data rows below the header.
    pub fn data_row_count(&self) -> u32 {
        self.last_row().saturating_sub(HEADER_ROW)
    }

    /// Write a text value into a data cell and record the edit.
    pub fn set_text(&mut self, row: u32, col: u32, value: &str) -> Result<()> {
        if row <= HEADER_ROW {
            return Err(anyhow!(
                "refusing to write header cell {}",
                cell_reference(row, col)
            ));
        }
        self.rows
            .entry(row)
            .or_default()
            .insert(col, CellValue::text(value));
        self.edits
            .entry(row)
            .or_default()
            .insert(col, value.to_string());
        Ok(())
    }

    /// Apply a row's staged writes through the resolved header.
    pub fn apply(&mut self, header: &HeaderMap, writes: &[CellWrite]) -> Result<()> {
        for write in writes {
            let col = header
                .position(&write.column)
                .ok_or_else(|| anyhow!("column {:?} is not in the header", write.column))?;
            self.set_text(write.row, col, &write.value)?;
        }
        Ok(())
    }

    /// Edits recorded since load, keyed by row then column.
    pub fn edits(&self) -> &BTreeMap<u32, BTreeMap<u32, String>> {
        &self.edits
    }

    pub fn has_edits(&self) -> bool {
        !self.edits.is_empty()
    }

    /// Snapshot a data row as a column-name keyed view.
    pub fn row_view(&self, header: &HeaderMap, row: u32) -> RowView {
        let values = header
            .columns()
            .map(|(name, col)| (name.to_string(), self.get(row, col).clone()))
            .collect();
        RowView { row, values }
    }
}

/// Header text to column index mapping, resolved once per run from row 1.
///
/// A header text that appears in more than one column is kept aside as
/// ambiguous: those columns never show up in row views, and naming one in
/// the config is an error.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    positions: BTreeMap<String, u32>,
    ambiguous: BTreeMap<String, Vec<u32>>,
}

impl HeaderMap {
    pub fn from_sheet(sheet: &Sheet) -> Result<Self> {
        let Some(cells) = sheet.rows.get(&HEADER_ROW) else {
            return Err(anyhow!("sheet {:?} has no header row", sheet.name));
        };
        let mut seen: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (col, value) in cells {
            if value.is_blank() {
                continue;
            }
            seen.entry(value.to_string().trim().to_string())
                .or_default()
                .push(*col);
        }
        let mut header = Self::default();
        for (name, cols) in seen {
            match cols.as_slice() {
                [col] => {
                    header.positions.insert(name, *col);
                }
                _ => {
                    tracing::debug!(header = %name, columns = cols.len(), "repeated header text");
                    header.ambiguous.insert(name, cols);
                }
            }
        }
        Ok(header)
    }

    /// Column of a header that appears exactly once.
    pub fn position(&self, name: &str) -> Option<u32> {
        self.positions.get(name).copied()
    }

    pub fn require(&self, name: &str, role: &str) -> Result<u32> {
        self.ensure_unambiguous(name, role)?;
        self.position(name).ok_or_else(|| {
            anyhow!(
                "{role} column {:?} not found in header (available: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Fail when `name` labels more than one column.
    pub fn ensure_unambiguous(&self, name: &str, role: &str) -> Result<()> {
        match self.ambiguous.get(name) {
            Some(cols) => Err(anyhow!(
                "{role} column {:?} is ambiguous: header appears in columns {}",
                name,
                cols.iter()
                    .map(|col| column_letters(*col))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            None => Ok(()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, u32)> {
        self.positions
            .iter()
            .map(|(name, col)| (name.as_str(), *col))
    }
}

/// Immutable snapshot of one data row, keyed by header text.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub row: u32,
    pub values: BTreeMap<String, CellValue>,
}

impl RowView {
    #[cfg(test)]
    pub fn new(row: u32) -> Self {
        Self {
            row,
            values: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with(mut self, column: &str, value: CellValue) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }

    /// Value of a column, or `None` when the column is not part of the row.
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }

    pub fn is_blank(&self, column: &str) -> bool {
        self.get(column).is_none_or(CellValue::is_blank)
    }

    /// Prompt rendering of a column; absent and blank render as "".
    pub fn display(&self, column: &str) -> String {
        self.get(column).map(ToString::to_string).unwrap_or_default()
    }

    pub(crate) fn stage(&mut self, column: &str, value: &str) {
        self.values
            .insert(column.to_string(), CellValue::text(value));
    }
}

/// A single staged cell write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWrite {
    pub row: u32,
    pub column: String,
    pub value: String,
}

/// Loads a sheet once per run and persists its edits at the end.
pub trait SheetStore {
    fn load(&self) -> Result<Sheet>;
    fn save(&self, sheet: &Sheet) -> Result<()>;
    fn describe(&self) -> String;
}

/// 0-based column index to A1 letters (`0` -> `A`, `26` -> `AA`).
pub fn column_letters(col: u32) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

pub fn cell_reference(row: u32, col: u32) -> String {
    format!("{}{}", column_letters(col), row)
}

/// Parse an A1 reference into (1-based row, 0-based column).
pub fn parse_cell_reference(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|ch: char| ch.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return None;
    }
    let mut col: u32 = 0;
    for ch in letters.chars() {
        let digit = (ch.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        col = col.checked_mul(26)?.checked_add(digit)?;
    }
    let row: u32 = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row, col - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> CellValue {
        CellValue::text(value)
    }

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
    }

    #[test]
    fn parse_cell_reference_accepts_lowercase_and_rejects_garbage() {
        assert_eq!(parse_cell_reference("B2"), Some((2, 1)));
        assert_eq!(parse_cell_reference("aa10"), Some((10, 26)));
        assert_eq!(parse_cell_reference("10"), None);
        assert_eq!(parse_cell_reference("B0"), None);
        assert_eq!(parse_cell_reference("B"), None);
    }

    #[test]
    fn blank_text_normalizes_to_empty() {
        assert_eq!(CellValue::text("   "), CellValue::Empty);
        assert!(CellValue::Text(" ".to_string()).is_blank());
        assert!(!CellValue::Number(0.0).is_blank());
    }

    #[test]
    fn numbers_display_without_trailing_fraction() {
        assert_eq!(CellValue::Number(3.0).to_string(), "3");
        assert_eq!(CellValue::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn repeated_headers_stay_out_of_the_way_until_named() {
        let sheet = Sheet::from_rows(
            "Sheet1",
            vec![
                vec![text("Task"), text("Notes"), text("Notes"), text("Difficulty")],
                vec![text("walk"), text("a"), text("b"), CellValue::Empty],
            ],
        );
        let header = HeaderMap::from_sheet(&sheet).expect("header");
        assert_eq!(header.require("Task", "input").expect("task"), 0);
        assert_eq!(header.require("Difficulty", "output").expect("difficulty"), 3);
        assert_eq!(header.position("Notes"), None);
        assert!(!sheet.row_view(&header, 2).values.contains_key("Notes"));

        let err = header.require("Notes", "input").expect_err("ambiguous");
        let message = err.to_string();
        assert!(message.contains("ambiguous"), "{message}");
        assert!(message.contains("B, C"), "{message}");
    }

    #[test]
    fn header_map_skips_blank_headers() {
        let sheet = Sheet::from_rows(
            "Sheet1",
            vec![vec![text("Task"), CellValue::Empty, text("Difficulty")]],
        );
        let header = HeaderMap::from_sheet(&sheet).expect("header");
        assert_eq!(header.position("Task"), Some(0));
        assert_eq!(header.position("Difficulty"), Some(2));
        assert_eq!(header.names().count(), 2);
    }

    #[test]
    fn set_text_records_edit_and_refuses_header() {
        let mut sheet = Sheet::from_rows("Sheet1", vec![vec![text("Task")], vec![text("x")]]);
        sheet.set_text(2, 1, "hard").expect("write");
        assert_eq!(sheet.get(2, 1), &text("hard"));
        assert_eq!(sheet.edits()[&2][&1], "hard");
        assert!(sheet.set_text(1, 0, "nope").is_err());
    }

    #[test]
    fn last_row_ignores_trailing_blank_rows() {
        let mut sheet = Sheet::from_rows("Sheet1", vec![vec![text("Task")], vec![text("x")]]);
        sheet.insert(9, 0, CellValue::Text("  ".to_string()));
        assert_eq!(sheet.last_row(), 2);
        assert_eq!(sheet.data_row_count(), 1);
    }

    #[test]
    fn row_view_includes_only_named_columns() {
        let sheet = Sheet::from_rows(
            "Sheet1",
            vec![
                vec![text("Task"), CellValue::Empty, text("Difficulty")],
                vec![text("walk"), text("orphan"), CellValue::Empty],
            ],
        );
        let header = HeaderMap::from_sheet(&sheet).expect("header");
        let view = sheet.row_view(&header, 2);
        assert_eq!(view.get("Task"), Some(&text("walk")));
        assert_eq!(view.get("Difficulty"), Some(&CellValue::Empty));
        assert_eq!(view.values.len(), 2);
        assert!(view.is_blank("Difficulty"));
    }
}
