//! Row eligibility.
//!
//! Criteria are ANDed. A column missing from the row fails its criterion, so
//! a misspelled filter column excludes rows rather than admitting them.
use crate::config::{FilterCriterion, FilterOperator};
use crate::sheet::{CellValue, RowView};
use serde_json::Value;
use std::cmp::Ordering;

/// True when `row` satisfies every criterion; an empty list admits every row.
pub fn matches(row: &RowView, criteria: &[FilterCriterion]) -> bool {
    criteria.iter().all(|criterion| {
        let passed = criterion_matches(row, criterion);
        if !passed {
            tracing::debug!(
                row = row.row,
                column = %criterion.column,
                operation = ?criterion.operation,
                "row excluded by filter"
            );
        }
        passed
    })
}

fn criterion_matches(row: &RowView, criterion: &FilterCriterion) -> bool {
    let Some(cell) = row.get(&criterion.column) else {
        return false;
    };
    match criterion.operation {
        FilterOperator::Equals => {
            CellValue::from_json(&criterion.value)
                .is_some_and(|expected| values_equal(cell, &expected))
        }
        FilterOperator::Contains => match (cell.as_text(), needle(&criterion.value)) {
            (Some(text), Some(needle)) => text.contains(&needle),
            _ => false,
        },
        FilterOperator::In => {
            let Value::Array(options) = &criterion.value else {
                tracing::warn!(
                    column = %criterion.column,
                    "filter operation `in` needs a list value; criterion never matches"
                );
                return false;
            };
            options
                .iter()
                .filter_map(CellValue::from_json)
                .any(|option| values_equal(cell, &option))
        }
        FilterOperator::GreaterThan => compare(cell, &criterion.value) == Some(Ordering::Greater),
        FilterOperator::LessThan => compare(cell, &criterion.value) == Some(Ordering::Less),
    }
}

fn values_equal(cell: &CellValue, expected: &CellValue) -> bool {
    match (cell, expected) {
        (CellValue::Empty, CellValue::Empty) => true,
        (CellValue::Text(left), CellValue::Text(right)) => left == right,
        (CellValue::Number(left), CellValue::Number(right)) => left == right,
        (CellValue::Bool(left), CellValue::Bool(right)) => left == right,
        _ => false,
    }
}

fn needle(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Ordering for number-number and text-text pairs only.
fn compare(cell: &CellValue, value: &Value) -> Option<Ordering> {
    match (cell, CellValue::from_json(value)?) {
        (CellValue::Number(left), CellValue::Number(right)) => left.partial_cmp(&right),
        (CellValue::Text(left), CellValue::Text(right)) => Some(left.as_str().cmp(right.as_str())),
        _ => None,
    }
}
