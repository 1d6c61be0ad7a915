//! Shared test infrastructure for integration tests.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const SHEET_PART: &str = "xl/worksheets/sheet1.xml";

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Tasks" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

/// Write a single-sheet workbook named "Tasks"; empty strings leave the cell out.
pub fn write_workbook(path: &Path, rows: &[&[&str]]) {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (row_idx, row) in rows.iter().enumerate() {
        let row_num = row_idx + 1;
        sheet.push_str(&format!(r#"<row r="{row_num}">"#));
        for (col_idx, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let letter = char::from(b'A' + col_idx as u8);
            sheet.push_str(&format!(
                r#"<c r="{letter}{row_num}" t="inlineStr"><is><t>{value}</t></is></c>"#
            ));
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let file = File::create(path).expect("create workbook");
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", ROOT_RELS),
        ("xl/workbook.xml", WORKBOOK),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
        (SHEET_PART, sheet.as_str()),
    ] {
        zip.start_file(name, options).expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish workbook");
}

/// Raw XML of the worksheet part.
pub fn read_sheet_xml(path: &Path) -> String {
    let file = File::open(path).expect("open workbook");
    let mut archive = ZipArchive::new(file).expect("read archive");
    let mut text = String::new();
    archive
        .by_name(SHEET_PART)
        .expect("worksheet entry")
        .read_to_string(&mut text)
        .expect("read worksheet");
    text
}

/// Inline-string cell markup as the store writes it.
pub fn inline_cell(reference: &str, value: &str) -> String {
    format!(r#"<c r="{reference}" t="inlineStr"><is><t>{value}</t></is></c>"#)
}

/// Write a `sh` script usable as `gateway.command`; returns the command line.
pub fn write_gateway_script(dir: &Path, body: &str) -> String {
    let path = dir.join("gateway.sh");
    fs::write(&path, body).expect("write gateway script");
    format!("sh {}", path.display())
}

pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("enrich.yaml");
    fs::write(&path, yaml).expect("write config");
    path
}

/// Number of lines in the call log a gateway script appends to.
pub fn call_count(log: &Path) -> usize {
    fs::read_to_string(log)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

pub fn run_cli(args: &[&str], current_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sheet-enrich"))
        .args(args)
        .current_dir(current_dir)
        .env("RUST_LOG", "info")
        .output()
        .expect("run sheet-enrich")
}
