//! Cell number formats from `xl/styles.xml`.
//!
//! Excel stores dates as day serials; only the cell's style says a number is
//! a date. Each `cellXfs/xf` entry maps a style index to a number format id,
//! which is either built in or declared under `numFmts`.
use super::xlsx::{attribute, xml_reader};
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use quick_xml::events::Event;
use quick_xml::name::QName;
use std::collections::HashMap;

pub(super) const STYLES_PART: &str = "xl/styles.xml";

const TAG_CUSTOM_FORMATS: QName = QName(b"numFmts");
const TAG_CUSTOM_FORMAT: QName = QName(b"numFmt");
const TAG_FORMAT_INDEXES: QName = QName(b"cellXfs");
const TAG_FORMAT_INDEX: QName = QName(b"xf");

const SECONDS_PER_DAY: i64 = 86_400;
// 9999-12-31 in the 1900 system
const MAX_SERIAL: f64 = 2_958_465.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum NumberFormat {
    #[default]
    General,
    Date,
    Time,
    DateTime,
}

impl NumberFormat {
    fn builtin(id: u32) -> Self {
        match id {
            14..=17 => NumberFormat::Date,
            22 => NumberFormat::DateTime,
            18..=21 | 45..=47 => NumberFormat::Time,
            _ => NumberFormat::General,
        }
    }

    /// Classify a custom format code by its unquoted date and time tokens.
    ///
    /// `m` is skipped since it means month or minute depending on context.
    fn from_code(code: &str) -> Self {
        let mut escaped = false;
        let mut quoted = false;
        let mut bracketed = false;
        let mut date = false;
        let mut time = false;
        for ch in code.chars() {
            match ch {
                _ if escaped => escaped = false,
                '\\' | '_' => escaped = true,
                '"' => quoted = !quoted,
                _ if quoted => {}
                '[' => bracketed = true,
                ']' => bracketed = false,
                _ if bracketed => {}
                'y' | 'Y' | 'd' | 'D' => date = true,
                'h' | 'H' | 's' | 'S' => time = true,
                _ => {}
            }
        }
        match (date, time) {
            (true, true) => NumberFormat::DateTime,
            (true, false) => NumberFormat::Date,
            (false, true) => NumberFormat::Time,
            (false, false) => NumberFormat::General,
        }
    }
}

/// Number format per cell style index, plus the workbook's date epoch.
#[derive(Debug, Clone, Default)]
pub(super) struct CellStyles {
    formats: Vec<NumberFormat>,
    date1904: bool,
}

impl CellStyles {
    pub(super) fn parse(bytes: &[u8], date1904: bool) -> Result<Self> {
        let mut reader = xml_reader(bytes);
        let mut buf = Vec::new();
        let mut custom: HashMap<u32, NumberFormat> = HashMap::new();
        let mut format_ids: Vec<u32> = Vec::new();
        let mut in_custom = false;
        let mut in_indexes = false;
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(event) if event.name() == TAG_CUSTOM_FORMATS => in_custom = true,
                Event::End(event) if event.name() == TAG_CUSTOM_FORMATS => in_custom = false,
                Event::Start(event) if event.name() == TAG_FORMAT_INDEXES => in_indexes = true,
                Event::End(event) if event.name() == TAG_FORMAT_INDEXES => in_indexes = false,
                Event::Start(event) if in_custom && event.name() == TAG_CUSTOM_FORMAT => {
                    let id = attribute(&event, b"numFmtId")?.and_then(|id| id.parse().ok());
                    if let (Some(id), Some(code)) = (id, attribute(&event, b"formatCode")?) {
                        custom.insert(id, NumberFormat::from_code(&code));
                    }
                }
                Event::Start(event) if in_indexes && event.name() == TAG_FORMAT_INDEX => {
                    let id = attribute(&event, b"numFmtId")?
                        .and_then(|id| id.parse().ok())
                        .unwrap_or(0);
                    format_ids.push(id);
                }
                _ => {}
            }
            buf.clear();
        }
        let formats = format_ids
            .into_iter()
            .map(|id| {
                custom
                    .get(&id)
                    .copied()
                    .unwrap_or_else(|| NumberFormat::builtin(id))
            })
            .collect();
        Ok(Self { formats, date1904 })
    }

    pub(super) fn format(&self, style: Option<usize>) -> NumberFormat {
        style
            .and_then(|index| self.formats.get(index))
            .copied()
            .unwrap_or_default()
    }

    /// ISO text for a date-formatted serial; `None` keeps the plain number.
    pub(super) fn render(&self, format: NumberFormat, serial: f64) -> Option<String> {
        if format == NumberFormat::General || !serial.is_finite() || !(0.0..=MAX_SERIAL).contains(&serial) {
            return None;
        }
        let total = (serial * SECONDS_PER_DAY as f64).round() as i64;
        let mut days = total.div_euclid(SECONDS_PER_DAY);
        let seconds = u32::try_from(total.rem_euclid(SECONDS_PER_DAY)).ok()?;
        if self.date1904 {
            days += 1_462;
        } else if days < 60 {
            // 1900 is treated as a leap year below serial 60
            days += 1;
        }
        let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        let date = epoch.checked_add_signed(TimeDelta::try_days(days)?)?;
        let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)?;
        let text = match format {
            NumberFormat::Date => date.format("%Y-%m-%d").to_string(),
            NumberFormat::Time => time.format("%H:%M:%S").to_string(),
            NumberFormat::DateTime => date.and_time(time).format("%Y-%m-%d %H:%M:%S").to_string(),
            NumberFormat::General => return None,
        };
        Some(text)
    }
}
