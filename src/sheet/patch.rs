//! Worksheet XML patching.
//!
//! Streams the original `sheetN.xml` through a quick-xml reader/writer pair and
//! re-emits every event unchanged, except for the cells being edited. Edited
//! cells become inline strings and keep their style index; rows and cells that
//! did not exist are inserted in sorted position. The `<dimension>` range and
//! row `spans` hints are widened to cover inserted cells.
use super::{cell_reference, parse_cell_reference};
use anyhow::{anyhow, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;

const TAG_SHEET_DATA: &[u8] = b"sheetData";
const TAG_ROW: &[u8] = b"row";
const TAG_CELL: &[u8] = b"c";
const TAG_FORMULA: &[u8] = b"f";
const TAG_DIMENSION: &[u8] = b"dimension";

/// Patched worksheet XML and how many replaced cells held a formula.
#[derive(Debug)]
pub(crate) struct PatchedWorksheet {
    pub xml: Vec<u8>,
    pub replaced_formulas: usize,
}

struct OpenRow {
    number: u32,
    cells: BTreeMap<u32, String>,
    next_col: u32,
}

struct WorksheetPatcher {
    writer: Writer<Vec<u8>>,
    pending: BTreeMap<u32, BTreeMap<u32, String>>,
    prefix: Option<String>,
    in_sheet_data: bool,
    last_row: u32,
    row: Option<OpenRow>,
    replaced_formulas: usize,
}

/// Apply `edits` (row -> column -> text) to worksheet XML.
pub(crate) fn patch_worksheet(
    original: &[u8],
    edits: &BTreeMap<u32, BTreeMap<u32, String>>,
) -> Result<PatchedWorksheet> {
    let mut reader = Reader::from_reader(original);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = false;
    config.trim_text(false);

    let mut patcher = WorksheetPatcher {
        writer: Writer::new(Vec::with_capacity(original.len() + 512)),
        pending: edits.clone(),
        prefix: None,
        in_sheet_data: false,
        last_row: 0,
        row: None,
        replaced_formulas: 0,
    };
    let mut skipping_cell = false;
    let mut saw_sheet_data = false;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf)?;
        if skipping_cell {
            match &event {
                Event::End(end) if end.local_name().as_ref() == TAG_CELL => skipping_cell = false,
                Event::Start(child) | Event::Empty(child) if is_tag(child, TAG_FORMULA) => {
                    patcher.replaced_formulas += 1;
                }
                _ => {}
            }
            buf.clear();
            continue;
        }
        match event {
            Event::Eof => break,
            Event::Empty(start) if !saw_sheet_data && is_tag(&start, TAG_DIMENSION) => {
                match patcher.widened_dimension(&start)? {
                    Some(widened) => patcher.writer.write_event(Event::Empty(widened))?,
                    None => patcher.writer.write_event(Event::Empty(start))?,
                }
            }
            Event::Start(start) if is_tag(&start, TAG_SHEET_DATA) => {
                saw_sheet_data = true;
                patcher.enter_sheet_data(&start);
                patcher.writer.write_event(Event::Start(start))?;
            }
            Event::Empty(start) if is_tag(&start, TAG_SHEET_DATA) => {
                saw_sheet_data = true;
                patcher.enter_sheet_data(&start);
                if patcher.pending.is_empty() {
                    patcher.writer.write_event(Event::Empty(start))?;
                } else {
                    let name = element_name(&start);
                    patcher.writer.write_event(Event::Start(start))?;
                    patcher.flush_rows_before(u32::MAX)?;
                    patcher.writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
                patcher.in_sheet_data = false;
            }
            Event::End(end) if end.local_name().as_ref() == TAG_SHEET_DATA => {
                patcher.flush_rows_before(u32::MAX)?;
                patcher.in_sheet_data = false;
                patcher.writer.write_event(Event::End(end))?;
            }
            Event::Start(start) if patcher.in_sheet_data && is_tag(&start, TAG_ROW) => {
                let number = patcher.row_number(&start)?;
                patcher.flush_rows_before(number)?;
                let cells = patcher.pending.remove(&number).unwrap_or_default();
                match widened_spans(&start, &cells)? {
                    Some(widened) => patcher.writer.write_event(Event::Start(widened))?,
                    None => patcher.writer.write_event(Event::Start(start))?,
                }
                patcher.row = Some(OpenRow {
                    number,
                    cells,
                    next_col: 0,
                });
            }
            Event::Empty(start) if patcher.in_sheet_data && is_tag(&start, TAG_ROW) => {
                let number = patcher.row_number(&start)?;
                patcher.flush_rows_before(number)?;
                match patcher.pending.remove(&number) {
                    Some(cells) => {
                        let name = element_name(&start);
                        match widened_spans(&start, &cells)? {
                            Some(widened) => patcher.writer.write_event(Event::Start(widened))?,
                            None => patcher.writer.write_event(Event::Start(start))?,
                        }
                        for (col, value) in &cells {
                            patcher.write_cell(number, *col, None, value)?;
                        }
                        patcher.writer.write_event(Event::End(BytesEnd::new(name)))?;
                    }
                    None => patcher.writer.write_event(Event::Empty(start))?,
                }
            }
            Event::End(end) if patcher.row.is_some() && end.local_name().as_ref() == TAG_ROW => {
                if let Some(row) = patcher.row.take() {
                    for (col, value) in &row.cells {
                        patcher.write_cell(row.number, *col, None, value)?;
                    }
                }
                patcher.writer.write_event(Event::End(end))?;
            }
            Event::Start(start) if patcher.row.is_some() && is_tag(&start, TAG_CELL) => {
                if patcher.replace_cell(&start)? {
                    skipping_cell = true;
                } else {
                    patcher.writer.write_event(Event::Start(start))?;
                }
            }
            Event::Empty(start) if patcher.row.is_some() && is_tag(&start, TAG_CELL) => {
                if !patcher.replace_cell(&start)? {
                    patcher.writer.write_event(Event::Empty(start))?;
                }
            }
            other => patcher.writer.write_event(other)?,
        }
        buf.clear();
    }

    if !saw_sheet_data && !edits.is_empty() {
        return Err(anyhow!("worksheet has no sheetData element"));
    }
    Ok(PatchedWorksheet {
        replaced_formulas: patcher.replaced_formulas,
        xml: patcher.writer.into_inner(),
    })
}

fn is_tag(start: &BytesStart<'_>, local: &[u8]) -> bool {
    start.local_name().as_ref() == local
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn attribute(start: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == local {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Copy of `start` with attribute `key` set to `value`, keeping attribute order.
fn with_attribute(start: &BytesStart<'_>, key: &str, value: &str) -> Result<BytesStart<'static>> {
    let mut out = BytesStart::new(element_name(start));
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            out.push_attribute((key, value));
        } else {
            out.push_attribute(attr);
        }
    }
    Ok(out)
}

/// Row start tag with a `spans="min:max"` hint stretched over `cells`.
///
/// Rows without a single-range hint are left alone.
fn widened_spans(
    start: &BytesStart<'_>,
    cells: &BTreeMap<u32, String>,
) -> Result<Option<BytesStart<'static>>> {
    let (Some(first), Some(last)) = (cells.keys().next(), cells.keys().next_back()) else {
        return Ok(None);
    };
    let Some(spans) = attribute(start, b"spans")? else {
        return Ok(None);
    };
    let Some((low, high)) = spans
        .split_once(':')
        .and_then(|(low, high)| Some((low.trim().parse::<u32>().ok()?, high.trim().parse::<u32>().ok()?)))
    else {
        return Ok(None);
    };
    let widened = (low.min(first + 1), high.max(last + 1));
    if widened == (low, high) {
        return Ok(None);
    }
    with_attribute(start, "spans", &format!("{}:{}", widened.0, widened.1)).map(Some)
}

/// Remove every `local` element whose `key` attribute satisfies `matches`,
/// children included. Everything else is re-emitted unchanged.
pub(crate) fn remove_elements(
    xml: &[u8],
    local: &[u8],
    key: &[u8],
    matches: impl Fn(&str) -> bool,
) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = false;
    config.trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut skip_depth = 0usize;
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf)?;
        if skip_depth > 0 {
            match &event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
            continue;
        }
        match event {
            Event::Eof => break,
            Event::Start(start)
                if is_tag(&start, local) && attribute(&start, key)?.is_some_and(|value| matches(&value)) =>
            {
                skip_depth = 1;
            }
            Event::Empty(start)
                if is_tag(&start, local) && attribute(&start, key)?.is_some_and(|value| matches(&value)) => {}
            other => writer.write_event(other)?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

/// Drop characters that are not allowed in XML 1.0 text.
fn xml_safe(value: &str) -> String {
    value
        .chars()
        .filter(|ch| matches!(ch, '\t' | '\n' | '\r') || *ch >= ' ')
        .collect()
}

impl WorksheetPatcher {
    fn enter_sheet_data(&mut self, start: &BytesStart<'_>) {
        self.in_sheet_data = true;
        self.prefix = start
            .name()
            .prefix()
            .map(|prefix| String::from_utf8_lossy(prefix.as_ref()).into_owned());
    }

    fn qualified(&self, local: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{local}"),
            None => local.to_string(),
        }
    }

    fn row_number(&mut self, start: &BytesStart<'_>) -> Result<u32> {
        let number = match attribute(start, b"r")? {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid row number {value:?}"))?,
            None => self.last_row + 1,
        };
        self.last_row = number;
        Ok(number)
    }

    /// Bounds of all pending edits as ((first row, first col), (last row, last col)).
    fn edit_bounds(&self) -> Option<((u32, u32), (u32, u32))> {
        let first_row = *self.pending.keys().next()?;
        let last_row = *self.pending.keys().next_back()?;
        let cols = self.pending.values().flat_map(|cells| cells.keys().copied());
        let (first_col, last_col) = cols.fold((u32::MAX, 0), |(low, high), col| {
            (low.min(col), high.max(col))
        });
        (first_col <= last_col).then_some(((first_row, first_col), (last_row, last_col)))
    }

    /// `<dimension ref>` stretched over the pending edits; `None` keeps the original.
    fn widened_dimension(&self, start: &BytesStart<'_>) -> Result<Option<BytesStart<'static>>> {
        let Some((first, last)) = self.edit_bounds() else {
            return Ok(None);
        };
        let Some(range) = attribute(start, b"ref")? else {
            return Ok(None);
        };
        let (from, to) = range.split_once(':').unwrap_or((&range, &range));
        let (Some(from), Some(to)) = (parse_cell_reference(from), parse_cell_reference(to)) else {
            return Ok(None);
        };
        let low = (from.0.min(first.0), from.1.min(first.1));
        let high = (to.0.max(last.0), to.1.max(last.1));
        if low == from && high == to {
            return Ok(None);
        }
        let widened = format!(
            "{}:{}",
            cell_reference(low.0, low.1),
            cell_reference(high.0, high.1)
        );
        with_attribute(start, "ref", &widened).map(Some)
    }

    /// Write pending rows numbered below `limit` as brand-new `<row>` elements.
    fn flush_rows_before(&mut self, limit: u32) -> Result<()> {
        let numbers: Vec<u32> = self.pending.range(..limit).map(|(row, _)| *row).collect();
        for number in numbers {
            let Some(cells) = self.pending.remove(&number) else {
                continue;
            };
            let row_name = self.qualified("row");
            let mut start = BytesStart::new(row_name.as_str());
            start.push_attribute(("r", number.to_string().as_str()));
            self.writer.write_event(Event::Start(start))?;
            for (col, value) in &cells {
                self.write_cell(number, *col, None, value)?;
            }
            self.writer
                .write_event(Event::End(BytesEnd::new(row_name)))?;
        }
        Ok(())
    }

    /// Handle an existing `<c>`; returns true when it was replaced.
    fn replace_cell(&mut self, start: &BytesStart<'_>) -> Result<bool> {
        let Some(row) = self.row.as_mut() else {
            return Ok(false);
        };
        let col = attribute(start, b"r")?
            .and_then(|reference| parse_cell_reference(&reference))
            .map(|(_, col)| col)
            .unwrap_or(row.next_col);
        row.next_col = col + 1;
        let number = row.number;
        let earlier: Vec<(u32, String)> = {
            let later = row.cells.split_off(&col);
            std::mem::replace(&mut row.cells, later).into_iter().collect()
        };
        let replacement = row.cells.remove(&col);
        for (earlier_col, value) in &earlier {
            self.write_cell(number, *earlier_col, None, value)?;
        }
        match replacement {
            Some(value) => {
                let style = attribute(start, b"s")?;
                self.write_cell(number, col, style.as_deref(), &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_cell(&mut self, row: u32, col: u32, style: Option<&str>, value: &str) -> Result<()> {
        let cell_name = self.qualified("c");
        let inline_name = self.qualified("is");
        let text_name = self.qualified("t");
        let reference = cell_reference(row, col);

        let mut cell = BytesStart::new(cell_name.as_str());
        cell.push_attribute(("r", reference.as_str()));
        if let Some(style) = style {
            cell.push_attribute(("s", style));
        }
        cell.push_attribute(("t", "inlineStr"));
        self.writer.write_event(Event::Start(cell))?;
        self.writer
            .write_event(Event::Start(BytesStart::new(inline_name.as_str())))?;
        let mut text = BytesStart::new(text_name.as_str());
        if value.trim() != value || value.contains('\n') {
            text.push_attribute(("xml:space", "preserve"));
        }
        self.writer.write_event(Event::Start(text))?;
        let safe = xml_safe(value);
        self.writer
            .write_event(Event::Text(BytesText::new(&safe)))?;
        self.writer.write_event(Event::End(BytesEnd::new(text_name)))?;
        self.writer
            .write_event(Event::End(BytesEnd::new(inline_name)))?;
        self.writer.write_event(Event::End(BytesEnd::new(cell_name)))?;
        Ok(())
    }
}
