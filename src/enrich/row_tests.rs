use super::*;
use crate::enrich::extract::MISSING_PROPERTY_DEFAULT;
use crate::enrich::retry::RetryPolicy;
use crate::enrich::schema::{PropertyType, ResponseSchema, SchemaProperty};
use crate::enrich::test_support::{RecordingSleeper, ScriptedGateway};
use crate::gateway::Completion;
use crate::sheet::CellValue;
use anyhow::anyhow;
use serde_json::json;
use std::time::Duration;

const RETRY_DELAY: Duration = Duration::from_secs(5);
const PACING: Duration = Duration::from_secs(1);

fn context<'a>(gateway: &'a ScriptedGateway, sleeper: &'a RecordingSleeper) -> RunContext<'a> {
    RunContext {
        gateway,
        sleeper,
        retry: RetryPolicy::new(3, RETRY_DELAY, PACING),
        model: "gpt-4o-mini".to_string(),
        system_message: "You are a helpful assistant.".to_string(),
    }
}

fn field(name: &str, inputs: &[&str]) -> OutputFieldSpec {
    OutputFieldSpec {
        name: name.to_string(),
        prompt: format!("Fill in {name}."),
        input_columns: inputs.iter().map(|input| input.to_string()).collect(),
        max_tokens: 50,
        temperature: 0.7,
        fetch_all: false,
        response_format: None,
    }
}

fn difficulty_schema() -> ResponseSchema {
    ResponseSchema {
        name: None,
        description: None,
        properties: vec![SchemaProperty {
            name: "difficulty".to_string(),
            kind: PropertyType::String,
            allowed: vec![json!("easy"), json!("medium"), json!("hard")],
            description: None,
        }],
    }
}

fn task_row(difficulty: CellValue) -> RowView {
    RowView::new(2)
        .with("Task", CellValue::text("walk on 1 leg"))
        .with("Difficulty", difficulty)
        .with("Notes", CellValue::Empty)
}

#[test]
fn prompt_lists_input_columns_in_order() {
    let spec = field("Difficulty", &["Task", "Notes", "Missing"]);
    let prompt = build_prompt(&spec, &task_row(CellValue::Empty));
    assert_eq!(
        prompt,
        "Fill in Difficulty.\nTask: walk on 1 leg\nNotes: \nMissing: "
    );
}

#[test]
fn schema_field_writes_structured_value() {
    let gateway = ScriptedGateway::new(vec![Ok(Completion::Structured(
        json!({"difficulty": "easy"}),
    ))]);
    let sleeper = RecordingSleeper::default();
    let mut spec = field("Difficulty", &["Task"]);
    spec.response_format = Some(difficulty_schema());

    let outcome = enrich_row(&context(&gateway, &sleeper), &[spec], &task_row(CellValue::Empty));

    assert_eq!(
        outcome.writes,
        vec![CellWrite {
            row: 2,
            column: "Difficulty".to_string(),
            value: "easy".to_string(),
        }]
    );
    assert_eq!(outcome.fields, vec![FieldOutcome::Written { attempts: 1 }]);

    let requests = gateway.requests();
    assert_eq!(requests.len(), 1);
    let structured = requests[0].structured.as_ref().expect("structured request");
    assert_eq!(structured.name, "difficulty_response");
    assert_eq!(structured.schema["required"], json!(["difficulty"]));
    assert_eq!(requests[0].prompt, "Fill in Difficulty.\nTask: walk on 1 leg");
    assert_eq!(requests[0].model, "gpt-4o-mini");
    assert_eq!(sleeper.sleeps(), vec![PACING]);
}

#[test]
fn populated_cell_is_skipped_without_a_call() {
    let gateway = ScriptedGateway::text(&["hard"]);
    let sleeper = RecordingSleeper::default();
    let outcome = enrich_row(
        &context(&gateway, &sleeper),
        &[field("Difficulty", &["Task"])],
        &task_row(CellValue::text("medium")),
    );
    assert!(outcome.writes.is_empty());
    assert_eq!(outcome.fields, vec![FieldOutcome::Skipped]);
    assert_eq!(gateway.calls(), 0);
    assert!(sleeper.sleeps().is_empty());
}

#[test]
fn fetch_all_overwrites_populated_cell() {
    let gateway = ScriptedGateway::text(&[" hard "]);
    let sleeper = RecordingSleeper::default();
    let mut spec = field("Difficulty", &["Task"]);
    spec.fetch_all = true;
    let outcome = enrich_row(
        &context(&gateway, &sleeper),
        &[spec],
        &task_row(CellValue::text("medium")),
    );
    assert_eq!(outcome.writes.len(), 1);
    assert_eq!(outcome.writes[0].value, "hard");
}

#[test]
fn three_failures_leave_cell_untouched() {
    let gateway = ScriptedGateway::new(vec![
        Err(anyhow!("timeout")),
        Err(anyhow!("timeout")),
        Err(anyhow!("timeout")),
    ]);
    let sleeper = RecordingSleeper::default();
    let outcome = enrich_row(
        &context(&gateway, &sleeper),
        &[field("Difficulty", &["Task"])],
        &task_row(CellValue::Empty),
    );
    assert!(outcome.writes.is_empty());
    assert_eq!(outcome.fields, vec![FieldOutcome::Failed { attempts: 3 }]);
    assert_eq!(gateway.calls(), 3);
    assert_eq!(sleeper.sleeps(), vec![RETRY_DELAY, RETRY_DELAY, PACING]);
}

#[test]
fn blank_answers_count_as_failed_attempts() {
    let gateway = ScriptedGateway::text(&["", "   ", "medium"]);
    let sleeper = RecordingSleeper::default();
    let outcome = enrich_row(
        &context(&gateway, &sleeper),
        &[field("Difficulty", &["Task"])],
        &task_row(CellValue::Empty),
    );
    assert_eq!(outcome.fields, vec![FieldOutcome::Written { attempts: 3 }]);
    assert_eq!(outcome.writes[0].value, "medium");
}

#[test]
fn failure_in_one_field_does_not_affect_others() {
    let gateway = ScriptedGateway::new(vec![
        Ok(Completion::Text("easy".to_string())),
        Err(anyhow!("boom")),
        Err(anyhow!("boom")),
        Err(anyhow!("boom")),
        Ok(Completion::Text("looks fine".to_string())),
    ]);
    let sleeper = RecordingSleeper::default();
    let fields = [
        field("Difficulty", &["Task"]),
        field("Owner", &["Task"]),
        field("Notes", &["Task"]),
    ];
    let row = task_row(CellValue::Empty).with("Owner", CellValue::Empty);
    let outcome = enrich_row(&context(&gateway, &sleeper), &fields, &row);

    let written: Vec<(&str, &str)> = outcome
        .writes
        .iter()
        .map(|write| (write.column.as_str(), write.value.as_str()))
        .collect();
    assert_eq!(written, [("Difficulty", "easy"), ("Notes", "looks fine")]);
    assert!(outcome.writes.iter().all(|write| write.row == 2));
    assert_eq!(
        outcome.fields,
        vec![
            FieldOutcome::Written { attempts: 1 },
            FieldOutcome::Failed { attempts: 3 },
            FieldOutcome::Written { attempts: 1 },
        ]
    );
}

#[test]
fn later_fields_see_values_staged_earlier_in_the_row() {
    let gateway = ScriptedGateway::text(&["hard", "Practice balance first."]);
    let sleeper = RecordingSleeper::default();
    let fields = [
        field("Difficulty", &["Task"]),
        field("Notes", &["Task", "Difficulty"]),
        field("Difficulty", &["Task"]),
    ];
    let outcome = enrich_row(&context(&gateway, &sleeper), &fields, &task_row(CellValue::Empty));

    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].prompt.ends_with("Difficulty: hard"));
    assert_eq!(outcome.fields[2], FieldOutcome::Skipped);
}

#[test]
fn missing_schema_property_stores_default() {
    let gateway = ScriptedGateway::new(vec![Ok(Completion::Structured(json!({"other": 1})))]);
    let sleeper = RecordingSleeper::default();
    let mut spec = field("Difficulty", &["Task"]);
    spec.response_format = Some(difficulty_schema());
    let outcome = enrich_row(&context(&gateway, &sleeper), &[spec], &task_row(CellValue::Empty));
    assert_eq!(outcome.writes[0].value, MISSING_PROPERTY_DEFAULT);
}
