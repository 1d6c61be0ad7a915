//! Per-row driver.
//!
//! Works on a snapshot of one row and returns the writes to apply; it never
//! touches the sheet itself. Values produced for earlier fields are staged
//! into the snapshot so later fields of the same row see them.
use super::extract::extract;
use super::retry::Attempted;
use super::RunContext;
use crate::config::OutputFieldSpec;
use crate::gateway::{CompletionRequest, StructuredOutput};
use crate::sheet::{CellWrite, RowView};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    /// Destination already held a value and `fetch_all` is off.
    Skipped,
    Written { attempts: u32 },
    Failed { attempts: u32 },
}

impl FieldOutcome {
    pub fn gateway_calls(&self) -> u32 {
        match self {
            FieldOutcome::Skipped => 0,
            FieldOutcome::Written { attempts } | FieldOutcome::Failed { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    pub row: u32,
    pub writes: Vec<CellWrite>,
    /// One entry per configured field, in declaration order.
    pub fields: Vec<FieldOutcome>,
}

/// Template followed by one `column: value` line per input column.
pub fn build_prompt(field: &OutputFieldSpec, row: &RowView) -> String {
    let mut prompt = field.prompt.clone();
    for column in &field.input_columns {
        prompt.push('\n');
        prompt.push_str(column);
        prompt.push_str(": ");
        prompt.push_str(&row.display(column));
    }
    prompt
}

pub fn build_request(ctx: &RunContext<'_>, field: &OutputFieldSpec, prompt: String) -> CompletionRequest {
    CompletionRequest {
        model: ctx.model.clone(),
        system_message: ctx.system_message.clone(),
        prompt,
        max_tokens: field.max_tokens,
        temperature: field.temperature,
        structured: field.response_format.as_ref().map(|schema| StructuredOutput {
            name: schema.request_name(&field.name),
            schema: schema.to_json_schema(),
        }),
    }
}

pub fn enrich_row(ctx: &RunContext<'_>, fields: &[OutputFieldSpec], row: &RowView) -> RowOutcome {
    let mut staged = row.clone();
    let mut writes = Vec::new();
    let mut outcomes = Vec::with_capacity(fields.len());

    for field in fields {
        let name = field.name.as_str();
        if !field.fetch_all && !staged.is_blank(name) {
            tracing::debug!(row = row.row, field = name, "value present; skipping");
            outcomes.push(FieldOutcome::Skipped);
            continue;
        }

        let request = build_request(ctx, field, build_prompt(field, &staged));
        let attempted = ctx.retry.run(ctx.sleeper, |attempt| {
            tracing::debug!(row = row.row, field = name, attempt, "requesting completion");
            let completion = ctx.gateway.complete(&request)?;
            if completion.is_empty() {
                return Ok(None);
            }
            Ok(extract(&completion, field))
        });

        match attempted {
            Attempted::Succeeded { value, attempts } => {
                tracing::info!(row = row.row, field = name, attempts, value = %value, "cell filled");
                staged.stage(name, &value);
                writes.push(CellWrite {
                    row: row.row,
                    column: name.to_string(),
                    value,
                });
                outcomes.push(FieldOutcome::Written { attempts });
            }
            Attempted::Exhausted {
                attempts,
                last_error,
            } => {
                tracing::error!(
                    row = row.row,
                    field = name,
                    attempts,
                    error = last_error.as_deref().unwrap_or("unknown"),
                    "giving up on cell"
                );
                outcomes.push(FieldOutcome::Failed { attempts });
            }
        }
        ctx.retry.pace(ctx.sleeper);
    }

    RowOutcome {
        row: row.row,
        writes,
        fields: outcomes,
    }
}

#[cfg(test)]
#[path = "row_tests.rs"]
mod tests;
