//! Correlates workbook rows with XML nodes and turns the differences into an
//! [`UpdatePlan`].
//!
//! Planning never touches the document; [`apply_plan`] performs the edits
//! afterwards. Node identity is the rule's element path plus the key value,
//! never the node's position.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{CompiledRule, OnEmpty, OnExtra, OnMissing, Target};
use crate::io::xml_doc::{NodeId, XmlDocument};
use crate::model::{CellValue, Row, RuleRows, normalize_key, parse_as};
use crate::report::{Issue, IssueKind, Skip};

/// Field value that differs between the row and the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub target: Target,
    /// Current value, `None` when the attribute or child does not exist.
    pub old: Option<String>,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Creates a node for `key` under `container`, after `after` when set.
    Insert {
        rule: String,
        container: NodeId,
        after: Option<NodeId>,
        item: String,
        template: Option<String>,
        key_target: Target,
        key: String,
        fields: Vec<FieldDiff>,
    },
    Update {
        rule: String,
        node: NodeId,
        key: String,
        diffs: Vec<FieldDiff>,
    },
    Delete {
        rule: String,
        node: NodeId,
        key: String,
    },
}

/// Operations for one file, in application order, plus what was recorded
/// instead of acted upon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    pub operations: Vec<Operation>,
    pub skipped: Vec<Skip>,
    pub issues: Vec<Issue>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Number of applied operations by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Candidate nodes of one rule in a document.
struct CandidateIndex {
    containers: Vec<NodeId>,
    /// All candidates in document order with their key, if any.
    candidates: Vec<(NodeId, Option<String>)>,
    by_key: HashMap<String, Vec<NodeId>>,
}

impl CandidateIndex {
    fn build(document: &XmlDocument, rule: &CompiledRule) -> Self {
        let containers = document.find_elements(rule.path.container());
        let mut candidates = Vec::new();
        let mut by_key: HashMap<String, Vec<NodeId>> = HashMap::new();
        for container in &containers {
            for node in document.element_children(*container) {
                if document.name(node) != Some(rule.path.item()) {
                    continue;
                }
                let key = document
                    .get(node, &rule.key.target)
                    .map(|value| normalize_key(&value))
                    .filter(|value| !value.is_empty());
                if let Some(key) = &key {
                    by_key.entry(key.clone()).or_default().push(node);
                }
                candidates.push((node, key));
            }
        }
        CandidateIndex {
            containers,
            candidates,
            by_key,
        }
    }

    /// Last candidate of the first container.
    fn insert_anchor(&self, document: &XmlDocument, item: &str) -> Option<NodeId> {
        let container = *self.containers.first()?;
        document
            .element_children(container)
            .into_iter()
            .filter(|node| document.name(*node) == Some(item))
            .last()
    }
}

/// Computes the plan for one document from the rules that target it.
pub fn compute_plan(document: &XmlDocument, rules: &[(&CompiledRule, &RuleRows)]) -> UpdatePlan {
    let mut plan = UpdatePlan::default();
    for (rule, rows) in rules {
        plan_rule(document, rule, rows, &mut plan);
    }
    plan
}

fn plan_rule(document: &XmlDocument, rule: &CompiledRule, rows: &RuleRows, plan: &mut UpdatePlan) {
    let index = CandidateIndex::build(document, rule);
    let before = plan.operations.len();

    for row in &rows.rows {
        match index.by_key.get(&row.key) {
            Some(nodes) => {
                for node in nodes {
                    let diffs = diff_fields(document, *node, rule, row);
                    if !diffs.is_empty() {
                        plan.operations.push(Operation::Update {
                            rule: rule.label.clone(),
                            node: *node,
                            key: row.key.clone(),
                            diffs,
                        });
                    }
                }
            }
            None => match rule.on_missing {
                OnMissing::Insert => match index.containers.first() {
                    Some(container) => plan.operations.push(Operation::Insert {
                        rule: rule.label.clone(),
                        container: *container,
                        after: index.insert_anchor(document, rule.path.item()),
                        item: rule.path.item().to_string(),
                        template: rule.template.clone(),
                        key_target: rule.key.target.clone(),
                        key: row.key.clone(),
                        fields: insert_fields(rule, row),
                    }),
                    None => plan.issues.push(Issue::row(
                        IssueKind::MappingPolicy,
                        &rule.label,
                        &row.key,
                        format!("no container element at '{}'", container_path(rule)),
                    )),
                },
                OnMissing::Skip => plan.skipped.push(Skip {
                    rule: rule.label.clone(),
                    key: row.key.clone(),
                }),
                OnMissing::Error => plan.issues.push(Issue::row(
                    IssueKind::MappingPolicy,
                    &rule.label,
                    &row.key,
                    format!("no element at '{}' has this key", rule.path),
                )),
            },
        }
    }

    if rule.on_extra == OnExtra::Delete {
        for (node, key) in &index.candidates {
            let Some(key) = key else {
                continue;
            };
            if !rows.claimed.contains(key) {
                plan.operations.push(Operation::Delete {
                    rule: rule.label.clone(),
                    node: *node,
                    key: key.clone(),
                });
            }
        }
    }

    debug!(
        rule = %rule.label,
        candidates = index.candidates.len(),
        operations = plan.operations.len() - before,
        "planned rule"
    );
}

fn container_path(rule: &CompiledRule) -> String {
    rule.path
        .container()
        .iter()
        .fold(String::new(), |path, segment| format!("{path}/{segment}"))
}

/// Values written into a new node; empty cells only produce a value when
/// the field clears.
fn insert_fields(rule: &CompiledRule, row: &Row) -> Vec<FieldDiff> {
    rule.fields
        .iter()
        .zip(&row.values)
        .filter(|(field, value)| !(value.is_empty() && field.on_empty == OnEmpty::Keep))
        .map(|(field, value)| FieldDiff {
            target: field.target.clone(),
            old: None,
            new: value.render(&field.date_format),
        })
        .collect()
}

fn diff_fields(
    document: &XmlDocument,
    node: NodeId,
    rule: &CompiledRule,
    row: &Row,
) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    for (field, value) in rule.fields.iter().zip(&row.values) {
        if value.is_empty() && field.on_empty == OnEmpty::Keep {
            continue;
        }
        let old = document.get(node, &field.target);
        let new = value.render(&field.date_format);
        let same = match (&old, value) {
            (None, CellValue::Empty) => true,
            (None, _) => false,
            (Some(old), CellValue::Empty) => old.is_empty(),
            (Some(old), _) => {
                *old == new
                    || parse_as(old, field.value_type, &field.date_format).as_ref() == Some(value)
            }
        };
        if !same {
            diffs.push(FieldDiff {
                target: field.target.clone(),
                old,
                new,
            });
        }
    }
    diffs
}

/// Applies a plan computed against `document`.
pub fn apply_plan(document: &mut XmlDocument, plan: &UpdatePlan) -> AppliedCounts {
    let mut counts = AppliedCounts::default();
    // Last node inserted per container, so consecutive inserts keep row order.
    let mut cursors: HashMap<NodeId, NodeId> = HashMap::new();

    for operation in &plan.operations {
        match operation {
            Operation::Insert {
                container,
                after,
                item,
                template,
                key_target,
                key,
                fields,
                ..
            } => {
                let node = template
                    .as_deref()
                    .and_then(|template| XmlDocument::parse_str(template).ok())
                    .and_then(|template| document.import_root(&template))
                    .unwrap_or_else(|| document.create_element(item));
                let anchor = cursors.get(container).copied().or(*after);
                document.insert_element(*container, anchor, node);
                document.set(node, key_target, key);
                for field in fields {
                    document.set(node, &field.target, &field.new);
                }
                cursors.insert(*container, node);
                counts.inserted += 1;
            }
            Operation::Update { node, diffs, .. } => {
                if !document.is_attached(*node) {
                    continue;
                }
                for diff in diffs {
                    document.set(*node, &diff.target, &diff.new);
                }
                counts.updated += 1;
            }
            Operation::Delete { node, .. } => {
                if !document.is_attached(*node) {
                    continue;
                }
                document.remove(*node);
                counts.deleted += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::Config;

    const ITEMS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<items>
    <!-- catalogue -->
    <item id="1"><name>Sword</name><price>10.50</price></item>
    <item id="3"><name>Bow</name><price>7</price></item>
    <item><name>Unkeyed</name></item>
</items>
"#;

    fn rule(on_missing: &str, on_extra: &str) -> CompiledRule {
        let json = format!(
            r#"{{
                "rules": [{{
                    "name": "items",
                    "sheet": "Items",
                    "files": "items.xml",
                    "path": "/items/item",
                    "key": {{ "column": "id", "target": "@id" }},
                    "fields": [
                        {{ "column": "name", "target": "name" }},
                        {{ "column": "price", "target": "price", "type": "float" }}
                    ],
                    "onMissing": "{on_missing}",
                    "onExtra": "{on_extra}"
                }}]
            }}"#
        );
        Config::from_json(&json)
            .expect("parsed")
            .compile()
            .expect("compiled")
            .remove(0)
    }

    fn rows(rows: Vec<(&str, &str, f64)>) -> RuleRows {
        let rows: Vec<Row> = rows
            .into_iter()
            .enumerate()
            .map(|(index, (key, name, price))| Row {
                number: index as u32 + 2,
                key: key.to_string(),
                values: vec![CellValue::String(name.to_string()), CellValue::Float(price)],
            })
            .collect();
        let claimed: HashSet<String> = rows.iter().map(|row| row.key.clone()).collect();
        RuleRows {
            sheet: "Items".into(),
            rows,
            claimed,
            issues: Vec::new(),
        }
    }

    #[test]
    fn typed_comparison_ignores_formatting() {
        let document = XmlDocument::parse_str(ITEMS).expect("parsed");
        let rule = rule("skip", "keep");
        let rows = rows(vec![("1", "Sword", 10.5), ("3", "Bow", 7.0)]);
        let plan = compute_plan(&document, &[(&rule, &rows)]);
        assert!(plan.is_empty());
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn updates_and_inserts_with_counts() {
        let mut document = XmlDocument::parse_str(ITEMS).expect("parsed");
        let rule = rule("insert", "keep");
        let rows = rows(vec![("1", "Sword", 12.0), ("3", "Bow", 7.0), ("2", "Shield", 5.0)]);
        let plan = compute_plan(&document, &[(&rule, &rows)]);
        assert_eq!(plan.operations.len(), 2);

        let counts = apply_plan(&mut document, &plan);
        assert_eq!(counts, AppliedCounts { inserted: 1, updated: 1, deleted: 0 });

        let xml = document.serialize();
        assert!(xml.contains(r#"<item id="1"><name>Sword</name><price>12</price></item>"#));
        assert!(xml.contains("<!-- catalogue -->"));
        assert!(xml.contains(r#"<item id="2">"#));
        let bow = xml.find(r#"id="3""#).expect("bow");
        let shield = xml.find(r#"id="2""#).expect("shield");
        assert!(shield > bow);

        let reparsed = XmlDocument::parse_str(&xml).expect("reparsed");
        assert!(compute_plan(&reparsed, &[(&rule, &rows)]).is_empty());
    }

    #[test]
    fn skip_and_error_policies_record_missing_rows() {
        let document = XmlDocument::parse_str(ITEMS).expect("parsed");
        let rows = rows(vec![("9", "Axe", 1.0)]);

        let skip = rule("skip", "keep");
        let plan = compute_plan(&document, &[(&skip, &rows)]);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped, vec![Skip { rule: "items".into(), key: "9".into() }]);

        let error = rule("error", "keep");
        let plan = compute_plan(&document, &[(&error, &rows)]);
        assert!(plan.is_empty());
        assert_eq!(plan.issues.len(), 1);
        assert_eq!(plan.issues[0].kind, IssueKind::MappingPolicy);
    }

    #[test]
    fn deletes_unclaimed_keys_only() {
        let mut document = XmlDocument::parse_str(ITEMS).expect("parsed");
        let rule = rule("skip", "delete");
        let mut rows = rows(vec![("1", "Sword", 10.5)]);
        let plan = compute_plan(&document, &[(&rule, &rows)]);
        assert_eq!(plan.operations.len(), 1);
        assert!(matches!(&plan.operations[0], Operation::Delete { key, .. } if key == "3"));

        rows.claimed.insert("3".to_string());
        assert!(compute_plan(&document, &[(&rule, &rows)]).is_empty());

        rows.claimed.remove("3");
        let plan = compute_plan(&document, &[(&rule, &rows)]);
        let counts = apply_plan(&mut document, &plan);
        assert_eq!(counts.deleted, 1);
        let xml = document.serialize();
        assert!(!xml.contains("Bow"));
        assert!(xml.contains("Unkeyed"));
    }

    #[test]
    fn missing_container_is_a_policy_failure() {
        let document = XmlDocument::parse_str("<catalogue/>").expect("parsed");
        let rule = rule("insert", "keep");
        let rows = rows(vec![("1", "Sword", 10.5)]);
        let plan = compute_plan(&document, &[(&rule, &rows)]);
        assert!(plan.is_empty());
        assert_eq!(plan.issues.len(), 1);
    }
}
