//! Whole-sheet pass.
//!
//! Column names are resolved against the header once, before any gateway
//! call. Rows are processed lowest first and each row's writes are applied as
//! soon as the row finishes. The sheet is persisted exactly once, also when
//! the pass stops early with an error.
use super::filter;
use super::row::{enrich_row, FieldOutcome, RowOutcome};
use super::RunContext;
use crate::config::{FilterCriterion, OutputFieldSpec};
use crate::sheet::{HeaderMap, Sheet, SheetStore, HEADER_ROW};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;

/// Per-field totals for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldSummary {
    pub field: String,
    pub written: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub sheet: String,
    pub rows_total: u32,
    pub rows_processed: u32,
    pub rows_filtered: u32,
    pub cells_written: u32,
    pub cells_failed: u32,
    pub cells_skipped: u32,
    pub gateway_calls: u32,
    pub fields: Vec<FieldSummary>,
}

impl RunSummary {
    fn new(sheet: &str, fields: &[OutputFieldSpec]) -> Self {
        Self {
            sheet: sheet.to_string(),
            fields: fields
                .iter()
                .map(|field| FieldSummary {
                    field: field.name.clone(),
                    ..FieldSummary::default()
                })
                .collect(),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &RowOutcome) {
        self.rows_processed += 1;
        for (summary, field) in self.fields.iter_mut().zip(&outcome.fields) {
            self.gateway_calls += field.gateway_calls();
            match field {
                FieldOutcome::Skipped => {
                    summary.skipped += 1;
                    self.cells_skipped += 1;
                }
                FieldOutcome::Written { .. } => {
                    summary.written += 1;
                    self.cells_written += 1;
                }
                FieldOutcome::Failed { .. } => {
                    summary.failed += 1;
                    self.cells_failed += 1;
                }
            }
        }
    }
}

pub struct SheetEnrichmentRunner<'a> {
    ctx: RunContext<'a>,
    fields: &'a [OutputFieldSpec],
    criteria: &'a [FilterCriterion],
    max_rows: Option<usize>,
}

impl<'a> SheetEnrichmentRunner<'a> {
    pub fn new(
        ctx: RunContext<'a>,
        fields: &'a [OutputFieldSpec],
        criteria: &'a [FilterCriterion],
    ) -> Self {
        Self {
            ctx,
            fields,
            criteria,
            max_rows: None,
        }
    }

    /// Stop after this many data rows.
    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Load, enrich and persist the sheet behind `store`.
    pub fn run(&self, store: &dyn SheetStore) -> Result<RunSummary> {
        let mut sheet = store
            .load()
            .with_context(|| format!("load {}", store.describe()))?;
        let header = resolve_columns(&sheet, self.fields, self.criteria)?;
        tracing::info!(
            sheet = sheet.name(),
            rows = sheet.data_row_count(),
            fields = self.fields.len(),
            max_attempts = self.ctx.retry.attempts(),
            gateway = %self.ctx.gateway.describe(),
            "starting enrichment pass"
        );
        let result = self.enrich_sheet(&mut sheet, &header);
        finish_pass(result, || {
            store
                .save(&sheet)
                .with_context(|| format!("save {}", store.describe()))
        })
    }

    fn enrich_sheet(&self, sheet: &mut Sheet, header: &HeaderMap) -> Result<RunSummary> {
        let mut summary = RunSummary::new(sheet.name(), self.fields);
        let mut total = sheet.data_row_count();
        if let Some(limit) = self.max_rows {
            total = total.min(u32::try_from(limit).unwrap_or(u32::MAX));
        }
        summary.rows_total = total;

        for index in 1..=total {
            let row = HEADER_ROW + index;
            tracing::info!(row, "row {index}/{total}");
            let view = sheet.row_view(header, row);
            if !filter::matches(&view, self.criteria) {
                tracing::debug!(row, "row filtered out");
                summary.rows_filtered += 1;
                continue;
            }
            let outcome = enrich_row(&self.ctx, self.fields, &view);
            sheet
                .apply(header, &outcome.writes)
                .with_context(|| format!("apply writes for row {row}"))?;
            tracing::debug!(row = outcome.row, writes = outcome.writes.len(), "row applied");
            summary.record(&outcome);
        }

        tracing::info!(
            rows = summary.rows_processed,
            filtered = summary.rows_filtered,
            written = summary.cells_written,
            failed = summary.cells_failed,
            "enrichment pass complete"
        );
        Ok(summary)
    }
}

/// Resolve output and input columns; a filter column that is absent only
/// warns, and rows then fail that criterion. Any configured column whose
/// header text repeats is an error.
pub fn resolve_columns(
    sheet: &Sheet,
    fields: &[OutputFieldSpec],
    criteria: &[FilterCriterion],
) -> Result<HeaderMap> {
    let header = HeaderMap::from_sheet(sheet)?;
    let mut inputs = BTreeSet::new();
    for field in fields {
        header.require(&field.name, "output")?;
        inputs.extend(field.input_columns.iter().map(String::as_str));
    }
    for column in inputs {
        header.require(column, "input")?;
    }
    for criterion in criteria {
        header.ensure_unambiguous(&criterion.column, "filter")?;
        if header.position(&criterion.column).is_none() {
            tracing::warn!(
                column = %criterion.column,
                "filter column not in header; no row will match"
            );
        }
    }
    Ok(header)
}

/// Persist after the pass whatever its outcome.
///
/// A pass error wins over a save error; the latter is logged.
pub fn finish_pass<T>(result: Result<T>, save: impl FnOnce() -> Result<()>) -> Result<T> {
    let saved = save();
    match (result, saved) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(save_err)) => {
            tracing::error!(error = %format!("{save_err:#}"), "save after failed pass also failed");
            Err(err)
        }
    }
}
