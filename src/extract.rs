//! Turns sheet tables into typed rows for a rule.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::{ColumnRef, CompiledRule};
use crate::error::ConfigError;
use crate::model::{CellValue, Row, RowIssue, RuleRows, SheetTable, coerce, normalize_key};

/// Absolute column indices of a rule's key and fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: usize,
    pub fields: Vec<usize>,
}

/// Resolves every column a rule reads against the sheet header.
pub fn bind(rule: &CompiledRule, table: &SheetTable) -> Result<Binding, Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut resolve = |column: &ColumnRef| match table.resolve(column) {
        Some(index) => Some(index),
        None => {
            errors.push(ConfigError::UnknownColumn {
                rule: rule.label.clone(),
                sheet: table.name.clone(),
                column: column.to_string(),
            });
            None
        }
    };
    let key = resolve(&rule.key.column);
    let fields: Vec<Option<usize>> = rule
        .fields
        .iter()
        .map(|field| resolve(&field.column))
        .collect();

    match (key, fields.into_iter().collect::<Option<Vec<_>>>()) {
        (Some(key), Some(fields)) if errors.is_empty() => Ok(Binding { key, fields }),
        _ => Err(errors),
    }
}

/// Checks that key values are unique in `key` column of the sheet.
/// Each duplicated key is reported once, against its first two rows.
pub fn check_unique_keys(table: &SheetTable, key: usize, column: &ColumnRef) -> Vec<ConfigError> {
    let mut first_seen: HashMap<String, u32> = HashMap::new();
    let mut reported: HashSet<String> = HashSet::new();
    let mut errors = Vec::new();
    for row in &table.rows {
        let value = normalize_key(&row.cell(key).to_text());
        if value.is_empty() {
            continue;
        }
        match first_seen.get(&value) {
            Some(first_row) => {
                if reported.insert(value.clone()) {
                    errors.push(ConfigError::DuplicateKeyColumn {
                        sheet: table.name.clone(),
                        column: column.to_string(),
                        key: value,
                        first_row: *first_row,
                        second_row: row.number,
                    });
                }
            }
            None => {
                first_seen.insert(value, row.number);
            }
        }
    }
    errors
}

/// Coerces the sheet rows for one rule. Rows whose cells cannot be coerced
/// are excluded and recorded; their keys stay claimed.
pub fn rule_rows(rule: &CompiledRule, binding: &Binding, table: &SheetTable) -> RuleRows {
    let mut prepared = RuleRows {
        sheet: table.name.clone(),
        ..RuleRows::default()
    };

    'rows: for raw in &table.rows {
        let key = normalize_key(&raw.cell(binding.key).to_text());
        if key.is_empty() {
            let has_values = binding.fields.iter().any(|column| !raw.cell(*column).is_empty());
            if has_values {
                prepared.issues.push(RowIssue {
                    sheet: table.name.clone(),
                    row: raw.number,
                    column: rule.key.column.to_string(),
                    message: "row has values but no key".to_string(),
                });
            }
            continue;
        }
        prepared.claimed.insert(key.clone());

        let mut values = Vec::with_capacity(rule.fields.len());
        for (field, column) in rule.fields.iter().zip(&binding.fields) {
            match coerce(raw.cell(*column), field.value_type, &field.date_format) {
                Ok(CellValue::String(text)) if field.escape_newlines => {
                    values.push(CellValue::String(escape_newlines(&text)));
                }
                Ok(value) => values.push(value),
                Err(err) => {
                    prepared.issues.push(RowIssue {
                        sheet: table.name.clone(),
                        row: raw.number,
                        column: field.column.to_string(),
                        message: err.to_string(),
                    });
                    continue 'rows;
                }
            }
        }
        prepared.rows.push(Row {
            number: raw.number,
            key,
            values,
        });
    }

    debug!(
        rule = %rule.label,
        sheet = %table.name,
        rows = prepared.rows.len(),
        issues = prepared.issues.len(),
        "prepared rule rows"
    );
    prepared
}

fn escape_newlines(text: &str) -> String {
    text.replace("\r\n", "\\n").replace('\n', "\\n")
}
