//! Workflow validate step.
//!
//! Loads the config and sheet, resolves every column and counts the cells a
//! run would request. Needs no credential and makes no service calls.
use super::workbook_store;
use crate::cli::ValidateArgs;
use crate::config::{self, Config, FilterCriterion, OutputFieldSpec};
use crate::enrich::filter;
use crate::enrich::runner::resolve_columns;
use crate::sheet::{HeaderMap, Sheet, SheetStore, HEADER_ROW};
use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ValidateReport {
    sheet: String,
    input_path: String,
    output_path: String,
    gateway: String,
    rows: u32,
    rows_eligible: u32,
    fields: Vec<PendingField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct PendingField {
    field: String,
    pending: u32,
}

pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    let config = config::load_config(&args.config)?;
    let store = workbook_store(&config);
    let sheet = store
        .load()
        .with_context(|| format!("load {}", store.describe()))?;
    let criteria = config.filter.active_criteria();
    let header = resolve_columns(&sheet, &config.columns.output, criteria)?;
    let (rows, rows_eligible, fields) = pending_cells(
        &sheet,
        &header,
        &config.columns.output,
        criteria,
        config.processing.max_rows,
    );

    let report = ValidateReport {
        sheet: sheet.name().to_string(),
        input_path: config.excel.input_path.display().to_string(),
        output_path: config.excel.destination().display().to_string(),
        gateway: gateway_label(&config),
        rows,
        rows_eligible,
        fields,
    };
    if args.json {
        let text =
            serde_json::to_string_pretty(&report).context("serialize validate report")?;
        println!("{text}");
    } else {
        println!(
            "sheet {}: {} rows, {} eligible, gateway {}",
            report.sheet, report.rows, report.rows_eligible, report.gateway
        );
        for field in &report.fields {
            println!("  {}: {} pending", field.field, field.pending);
        }
    }
    Ok(())
}

fn gateway_label(config: &Config) -> String {
    match config.gateway.command.as_deref() {
        Some(command) => format!("command `{command}`"),
        None => config.openai.base_url.clone(),
    }
}

/// Rows considered, rows passing the filter and per-field cells a run would fetch.
fn pending_cells(
    sheet: &Sheet,
    header: &HeaderMap,
    fields: &[OutputFieldSpec],
    criteria: &[FilterCriterion],
    max_rows: Option<usize>,
) -> (u32, u32, Vec<PendingField>) {
    let mut total = sheet.data_row_count();
    if let Some(limit) = max_rows {
        total = total.min(u32::try_from(limit).unwrap_or(u32::MAX));
    }
    let mut eligible = 0;
    let mut pending: Vec<PendingField> = fields
        .iter()
        .map(|field| PendingField {
            field: field.name.clone(),
            pending: 0,
        })
        .collect();
    for index in 1..=total {
        let view = sheet.row_view(header, HEADER_ROW + index);
        if !filter::matches(&view, criteria) {
            continue;
        }
        eligible += 1;
        for (count, field) in pending.iter_mut().zip(fields) {
            if field.fetch_all || view.is_blank(&field.name) {
                count.pending += 1;
            }
        }
    }
    (total, eligible, pending)
}
