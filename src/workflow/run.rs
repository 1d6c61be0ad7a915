//! Workflow run step: one full enrichment pass over the configured sheet.
use super::workbook_store;
use crate::cli::RunArgs;
use crate::config::{self, Config};
use crate::enrich::retry::{RetryPolicy, ThreadSleeper};
use crate::enrich::runner::{RunSummary, SheetEnrichmentRunner};
use crate::enrich::RunContext;
use crate::gateway::{CommandGateway, CompletionGateway, OpenAiGateway};
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RunReport {
    output_path: String,
    #[serde(flatten)]
    summary: RunSummary,
}

pub fn run_run(args: &RunArgs) -> Result<()> {
    let config = config::load_config(&args.config)?;
    let gateway = build_gateway(&config)?;
    let store = workbook_store(&config);
    let ctx = RunContext {
        gateway: gateway.as_ref(),
        sleeper: &ThreadSleeper,
        retry: RetryPolicy::from_config(&config.processing),
        model: config.openai.model.clone(),
        system_message: config.openai.system_message.clone(),
    };
    let summary = SheetEnrichmentRunner::new(
        ctx,
        &config.columns.output,
        config.filter.active_criteria(),
    )
    .with_max_rows(config.processing.max_rows)
    .run(&store)?;

    let report = RunReport {
        output_path: config.excel.destination().display().to_string(),
        summary,
    };
    if args.json {
        let text = serde_json::to_string_pretty(&report).context("serialize run summary")?;
        println!("{text}");
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Local command when configured, otherwise the HTTP service with its API key.
fn build_gateway(config: &Config) -> Result<Box<dyn CompletionGateway>> {
    if let Some(command) = config.gateway.command.as_deref() {
        return Ok(Box::new(CommandGateway::new(command)?));
    }
    config::load_dotenv();
    let api_key = config::resolve_api_key(&config.openai)?;
    Ok(Box::new(OpenAiGateway::new(
        &config.openai.base_url,
        api_key,
        Duration::from_secs(config.openai.timeout_secs),
    )))
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    println!(
        "sheet {}: {} rows ({} filtered), {} written, {} failed, {} already filled",
        summary.sheet,
        summary.rows_total,
        summary.rows_filtered,
        summary.cells_written,
        summary.cells_failed,
        summary.cells_skipped
    );
    for field in &summary.fields {
        println!(
            "  {}: {} written, {} failed, {} skipped",
            field.field, field.written, field.failed, field.skipped
        );
    }
    println!("saved {}", report.output_path);
}
