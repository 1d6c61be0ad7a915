//! XLSX workbook store.
//!
//! Loading reads `xl/workbook.xml`, its relationships, the shared string
//! table and the cell styles to locate and decode one worksheet. Saving
//! rewrites the archive entry by entry: every part except the worksheet is
//! raw-copied, and the worksheet XML is patched so only edited cells change.
//! Overwriting a formula cell drops the calculation chain, which Excel
//! rebuilds on open.
use super::patch::{patch_worksheet, remove_elements};
use super::styles::{CellStyles, NumberFormat, STYLES_PART};
use super::{parse_cell_reference, CellValue, Sheet, SheetStore};
use anyhow::{anyhow, Context, Result};
use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const CALC_CHAIN_PART: &str = "xl/calcChain.xml";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

const TAG_SHEET: QName = QName(b"sheet");
const TAG_WORKBOOK_PROPERTIES: &[u8] = b"workbookPr";
const TAG_RELATIONSHIP: &[u8] = b"Relationship";
const TAG_SHARED_STRING_ITEM: QName = QName(b"si");
const TAG_PHONETIC_TEXT: QName = QName(b"rPh");
const TAG_TEXT: QName = QName(b"t");
const TAG_ROW: &[u8] = b"row";
const TAG_CELL: &[u8] = b"c";
const TAG_INLINE_STRING: &[u8] = b"is";
const TAG_VALUE: &[u8] = b"v";

/// A worksheet inside an `.xlsx` file, saved in place or to a separate path.
#[derive(Debug, Clone)]
pub struct XlsxStore {
    source: PathBuf,
    destination: PathBuf,
    sheet_name: String,
}

impl XlsxStore {
    pub fn new(source: PathBuf, destination: Option<PathBuf>, sheet_name: &str) -> Self {
        let destination = destination.unwrap_or_else(|| source.clone());
        Self {
            source,
            destination,
            sheet_name: sheet_name.to_string(),
        }
    }

    fn open_archive(&self) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(&self.source)
            .with_context(|| format!("open workbook {}", self.source.display()))?;
        ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("read {} as an xlsx archive", self.source.display()))
    }
}

impl SheetStore for XlsxStore {
    fn load(&self) -> Result<Sheet> {
        let mut archive = self.open_archive()?;
        let SheetPart { path: part, date1904 } = locate_sheet_part(&mut archive, &self.sheet_name)?;
        let styles = match read_part(&mut archive, STYLES_PART)? {
            Some(bytes) => CellStyles::parse(&bytes, date1904).context("parse cell styles")?,
            None => CellStyles::default(),
        };
        let shared_strings = match read_part(&mut archive, SHARED_STRINGS_PART)? {
            Some(bytes) => parse_shared_strings(&bytes).context("parse shared strings")?,
            None => Vec::new(),
        };
        let bytes = read_part(&mut archive, &part)?
            .ok_or_else(|| anyhow!("worksheet part {part} is missing from the archive"))?;
        let mut sheet = Sheet::new(&self.sheet_name);
        parse_worksheet(&bytes, &shared_strings, &styles, &mut sheet)
            .with_context(|| format!("parse worksheet {part}"))?;
        tracing::debug!(
            sheet = %self.sheet_name,
            part = %part,
            rows = sheet.last_row(),
            "loaded worksheet"
        );
        Ok(sheet)
    }

    fn save(&self, sheet: &Sheet) -> Result<()> {
        if !sheet.has_edits() {
            if self.destination != self.source {
                fs::copy(&self.source, &self.destination).with_context(|| {
                    format!(
                        "copy {} to {}",
                        self.source.display(),
                        self.destination.display()
                    )
                })?;
            }
            tracing::info!(path = %self.destination.display(), "no cell changes to save");
            return Ok(());
        }

        let mut archive = self.open_archive()?;
        let part = locate_sheet_part(&mut archive, &self.sheet_name)?.path;
        let original = read_part(&mut archive, &part)?
            .ok_or_else(|| anyhow!("worksheet part {part} is missing from the archive"))?;
        let patched = patch_worksheet(&original, sheet.edits())
            .with_context(|| format!("patch worksheet {part}"))?;
        let drop_calc_chain = patched.replaced_formulas > 0;
        if drop_calc_chain {
            tracing::debug!(
                formulas = patched.replaced_formulas,
                "formula cells overwritten; dropping calculation chain"
            );
        }

        let dir = self
            .destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;
        let mut writer = ZipWriter::new(temp);

        for index in 0..archive.len() {
            let name = archive.by_index_raw(index)?.name().to_string();
            if name.eq_ignore_ascii_case(&part) {
                write_entry(&mut writer, &name, &patched.xml)?;
            } else if drop_calc_chain && name.eq_ignore_ascii_case(CALC_CHAIN_PART) {
                continue;
            } else if drop_calc_chain && name.eq_ignore_ascii_case(WORKBOOK_RELS_PART) {
                let rels = read_entry(&mut archive, index, &name)?;
                let rels = remove_elements(&rels, TAG_RELATIONSHIP, b"Type", |kind| {
                    kind.ends_with("/calcChain")
                })
                .with_context(|| format!("rewrite {name}"))?;
                write_entry(&mut writer, &name, &rels)?;
            } else if drop_calc_chain && name.eq_ignore_ascii_case(CONTENT_TYPES_PART) {
                let types = read_entry(&mut archive, index, &name)?;
                let types = remove_elements(&types, b"Override", b"PartName", |part_name| {
                    part_name.eq_ignore_ascii_case("/xl/calcChain.xml")
                })
                .with_context(|| format!("rewrite {name}"))?;
                write_entry(&mut writer, &name, &types)?;
            } else {
                writer
                    .raw_copy_file(archive.by_index_raw(index)?)
                    .with_context(|| format!("copy archive entry {name}"))?;
            }
        }

        let temp = writer.finish().context("finish xlsx archive")?;
        drop(archive);
        // temp files are created owner-only
        if let Ok(metadata) = fs::metadata(&self.source) {
            if let Err(err) = fs::set_permissions(temp.path(), metadata.permissions()) {
                tracing::warn!(error = %err, "could not carry file permissions over");
            }
        }
        temp.persist(&self.destination)
            .map_err(|err| err.error)
            .with_context(|| format!("replace {}", self.destination.display()))?;
        let cells: usize = sheet.edits().values().map(|cols| cols.len()).sum();
        tracing::info!(path = %self.destination.display(), cells, "saved workbook");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}[{}]", self.source.display(), self.sheet_name)
    }
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, index: usize, name: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    archive
        .by_index(index)?
        .read_to_end(&mut bytes)
        .with_context(|| format!("read {name}"))?;
    Ok(bytes)
}

fn write_entry<W: Write + Seek>(writer: &mut ZipWriter<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(name, options)?;
    writer
        .write_all(bytes)
        .with_context(|| format!("write {name}"))
}

/// Read a whole archive entry, matching names case-insensitively.
fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>> {
    let pattern = name.replace('\\', "/");
    let Some(actual) = archive
        .file_names()
        .find(|file_name| pattern.eq_ignore_ascii_case(file_name))
        .map(str::to_owned)
    else {
        return Ok(None);
    };
    let mut bytes = Vec::new();
    archive
        .by_name(&actual)?
        .read_to_end(&mut bytes)
        .with_context(|| format!("read {actual}"))?;
    Ok(Some(bytes))
}

struct SheetPart {
    path: String,
    date1904: bool,
}

/// Resolve a sheet name to its worksheet part path through the workbook relationships.
fn locate_sheet_part<R: Read + Seek>(archive: &mut ZipArchive<R>, sheet_name: &str) -> Result<SheetPart> {
    let rels = read_part(archive, WORKBOOK_RELS_PART)?
        .ok_or_else(|| anyhow!("{WORKBOOK_RELS_PART} is missing"))?;
    let relationships = parse_relationships(&rels)?;
    let workbook = read_part(archive, WORKBOOK_PART)?
        .ok_or_else(|| anyhow!("{WORKBOOK_PART} is missing"))?;
    let (sheets, date1904) = parse_workbook_sheets(&workbook)?;

    let Some((_, rel_id)) = sheets.iter().find(|(name, _)| name == sheet_name) else {
        let available: Vec<&str> = sheets.iter().map(|(name, _)| name.as_str()).collect();
        return Err(anyhow!(
            "sheet {:?} not found in workbook (available: {})",
            sheet_name,
            available.join(", ")
        ));
    };
    let path = relationships
        .get(rel_id)
        .cloned()
        .ok_or_else(|| anyhow!("sheet {:?} has no worksheet relationship", sheet_name))?;
    Ok(SheetPart { path, date1904 })
}

pub(super) fn xml_reader(bytes: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = true;
    config.trim_text(false);
    reader
}

pub(super) fn attribute(event: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for attr in event.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == local {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_relationships(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut relationships = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(event) if event.local_name().as_ref() == TAG_RELATIONSHIP => {
                let is_worksheet = attribute(&event, b"Type")?
                    .is_none_or(|kind| kind.ends_with("/worksheet"));
                if let (true, Some(id), Some(target)) = (
                    is_worksheet,
                    attribute(&event, b"Id")?,
                    attribute(&event, b"Target")?,
                ) {
                    relationships.insert(id, to_zip_path(&target));
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(relationships)
}

fn to_zip_path(target: &str) -> String {
    if let Some(stripped) = target.strip_prefix('/') {
        stripped.to_string()
    } else if target.starts_with("xl/") {
        target.to_string()
    } else {
        format!("xl/{target}")
    }
}

/// Sheet names paired with their relationship ids, in workbook order, and
/// whether the workbook counts dates from 1904.
fn parse_workbook_sheets(bytes: &[u8]) -> Result<(Vec<(String, String)>, bool)> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    let mut date1904 = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(event) if event.local_name().as_ref() == TAG_SHEET.as_ref() => {
                if let (Some(name), Some(id)) =
                    (attribute(&event, b"name")?, attribute(&event, b"id")?)
                {
                    sheets.push((name, id));
                }
            }
            Event::Start(event) if event.local_name().as_ref() == TAG_WORKBOOK_PROPERTIES => {
                date1904 = attribute(&event, b"date1904")?
                    .is_some_and(|value| value == "1" || value == "true");
            }
            _ => {}
        }
        buf.clear();
    }
    Ok((sheets, date1904))
}

fn push_reference(text: &mut String, reference: &BytesRef<'_>) -> Result<()> {
    let raw = reference.xml_content()?;
    if let Some(number) = raw.strip_prefix('#') {
        let code = match number.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16)?,
            None => number.parse::<u32>()?,
        };
        if let Some(ch) = char::from_u32(code) {
            text.push(ch);
        }
    } else if let Some(entity) = resolve_xml_entity(&raw) {
        text.push_str(entity);
    } else {
        return Err(anyhow!("unknown XML entity &{raw};"));
    }
    Ok(())
}

/// Collect the text of an `<si>` or `<is>` element, skipping phonetic runs.
fn read_rich_text(reader: &mut Reader<&[u8]>, end: &[u8]) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut in_text = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => return Err(anyhow!("unexpected end of XML inside string item")),
            Event::End(event) if event.local_name().as_ref() == end => break,
            Event::Start(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = true,
            Event::End(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = false,
            Event::Start(event) if !in_phonetic && event.local_name().as_ref() == TAG_TEXT.as_ref() => {
                in_text = true
            }
            Event::End(event) if event.local_name().as_ref() == TAG_TEXT.as_ref() => in_text = false,
            Event::Text(event) if in_text => text.push_str(&event.xml_content()?),
            Event::CData(event) if in_text => text.push_str(&event.xml_content()?),
            Event::GeneralRef(event) if in_text => push_reference(&mut text, &event)?,
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn read_value(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => return Err(anyhow!("unexpected end of XML inside cell value")),
            Event::End(event) if event.local_name().as_ref() == TAG_VALUE => break,
            Event::Text(event) => text.push_str(&event.xml_content()?),
            Event::CData(event) => text.push_str(&event.xml_content()?),
            Event::GeneralRef(event) => push_reference(&mut text, &event)?,
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn parse_shared_strings(bytes: &[u8]) -> Result<Vec<String>> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(event) if event.name() == TAG_SHARED_STRING_ITEM => {
                strings.push(read_rich_text(&mut reader, TAG_SHARED_STRING_ITEM.as_ref())?);
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Number,
    SharedString,
    InlineString,
    FormulaString,
    Boolean,
    Error,
    Date,
}

impl CellKind {
    fn from_attribute(value: Option<&str>) -> Self {
        match value {
            Some("s") => CellKind::SharedString,
            Some("inlineStr") => CellKind::InlineString,
            Some("str") => CellKind::FormulaString,
            Some("b") => CellKind::Boolean,
            Some("e") => CellKind::Error,
            Some("d") => CellKind::Date,
            _ => CellKind::Number,
        }
    }
}

fn decode_value(
    kind: CellKind,
    format: NumberFormat,
    raw: String,
    shared: &[String],
    styles: &CellStyles,
) -> Result<CellValue> {
    let value = match kind {
        CellKind::SharedString => {
            let index: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("shared string index {raw:?}"))?;
            let text = shared
                .get(index)
                .ok_or_else(|| anyhow!("shared string index {index} out of range"))?;
            CellValue::text(text.clone())
        }
        CellKind::InlineString | CellKind::FormulaString | CellKind::Error | CellKind::Date => {
            CellValue::text(raw)
        }
        CellKind::Boolean => CellValue::Bool(raw.trim() == "1" || raw.trim() == "true"),
        CellKind::Number => {
            if raw.trim().is_empty() {
                CellValue::Empty
            } else {
                match raw.trim().parse::<f64>() {
                    Ok(number) => match styles.render(format, number) {
                        Some(text) => CellValue::Text(text),
                        None => CellValue::Number(number),
                    },
                    Err(_) => CellValue::text(raw),
                }
            }
        }
    };
    Ok(value)
}

fn parse_worksheet(
    bytes: &[u8],
    shared: &[String],
    styles: &CellStyles,
    sheet: &mut Sheet,
) -> Result<()> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut row: u32 = 0;
    let mut next_col: u32 = 0;
    let mut cell: Option<(u32, CellKind, NumberFormat)> = None;
    let mut raw = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(event) if event.local_name().as_ref() == TAG_ROW => {
                row = match attribute(&event, b"r")? {
                    Some(value) => value
                        .parse()
                        .with_context(|| format!("row number {value:?}"))?,
                    None => row + 1,
                };
                next_col = 0;
            }
            Event::Start(event) if event.local_name().as_ref() == TAG_CELL => {
                let position = attribute(&event, b"r")?
                    .and_then(|reference| parse_cell_reference(&reference))
                    .map(|(_, col)| col)
                    .unwrap_or(next_col);
                next_col = position + 1;
                let kind = CellKind::from_attribute(attribute(&event, b"t")?.as_deref());
                let style = attribute(&event, b"s")?.and_then(|index| index.parse().ok());
                cell = Some((position, kind, styles.format(style)));
                raw.clear();
            }
            Event::Start(event) if event.local_name().as_ref() == TAG_INLINE_STRING => {
                raw = read_rich_text(&mut reader, TAG_INLINE_STRING)?;
            }
            Event::Start(event) if event.local_name().as_ref() == TAG_VALUE => {
                raw = read_value(&mut reader)?;
            }
            Event::End(event) if event.local_name().as_ref() == TAG_CELL => {
                if let Some((col, kind, format)) = cell.take() {
                    let value = decode_value(kind, format, std::mem::take(&mut raw), shared, styles)?;
                    sheet.insert(row, col, value);
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

#[cfg(test)]
#[path = "xlsx_tests.rs"]
mod tests;
