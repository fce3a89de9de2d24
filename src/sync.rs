//! Orchestration of a synchronisation run.
//!
//! Both modes share the same steps: compile the configuration, resolve
//! sheets, validate the workbook against every rule (exhaustively, before any
//! file is touched), then plan and apply per XML file. Normal mode streams
//! the rows a file needs and handles one file at a time; quick mode loads
//! everything up front and plans files in parallel.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use calamine::Reader;
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::config::{ColumnRef, CompiledRule, Config};
use crate::error::{ConfigError, ConfigErrors, Result};
use crate::extract::{self, Binding};
use crate::io::discover::{self, XmlFile};
use crate::io::excel_read::{self, Workbook};
use crate::io::xml_doc::XmlDocument;
use crate::io::xml_write;
use crate::mapper::{apply_plan, compute_plan};
use crate::model::{RuleRows, SheetTable};
use crate::report::{FileReport, FileStatus, Issue, IssueKind, ReportBuilder, RunReport};

/// Execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sequential, one file in memory at a time.
    Normal,
    /// All inputs loaded up front, files planned in parallel.
    Quick,
}

/// Cooperative cancellation flag, checked between files and before each
/// write.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancelToken,
}

/// A rule with its sheet resolved against the workbook.
struct SheetRule<'a> {
    rule: &'a CompiledRule,
    sheet: String,
}

/// Result of processing one document in memory.
struct Processed {
    report: FileReport,
    /// New content, present only when it differs from the file on disk.
    output: Option<String>,
}

/// Runs the configured rules against every XML file under `xml_dir`.
pub fn run(
    config: &Config,
    excel: &Path,
    xml_dir: &Path,
    mode: Mode,
    options: &RunOptions,
) -> Result<RunReport> {
    run_with_errors(config, Vec::new(), excel, xml_dir, mode, options)
}

/// Same as [`run`], for a configuration parsed with
/// [`Config::from_json_partial`]: `parse_errors` are reported together with
/// every violation found on the valid rules, and no file is touched when
/// any violation exists.
#[instrument(
    level = "info",
    skip_all,
    fields(excel = %excel.display(), xml_dir = %xml_dir.display(), ?mode)
)]
pub fn run_with_errors(
    config: &Config,
    parse_errors: Vec<ConfigError>,
    excel: &Path,
    xml_dir: &Path,
    mode: Mode,
    options: &RunOptions,
) -> Result<RunReport> {
    let (rules, compile_errors) = config.compile_partial();
    let mut pending = parse_errors;
    pending.extend(compile_errors);
    let mut workbook = excel_read::open(excel)?;
    let (sheet_rules, sheet_errors) = resolve_sheets(&rules, &workbook.sheet_names());
    pending.extend(sheet_errors);
    let files = discover::xml_files(xml_dir, &config.ignore_dirs)?;
    info!(rules = rules.len(), files = files.len(), "starting run");

    let report = match mode {
        Mode::Normal => run_normal(&mut workbook, &sheet_rules, pending, &files, options)?,
        Mode::Quick => run_quick(
            &mut workbook,
            &sheet_rules,
            pending,
            &files,
            config.all_or_nothing,
            options,
        )?,
    };

    info!(
        status = ?report.status,
        inserted = report.totals.inserted,
        updated = report.totals.updated,
        deleted = report.totals.deleted,
        files_failed = report.totals.files_failed,
        "run finished"
    );
    Ok(report)
}

/// Resolves each rule's sheet; rules naming a missing sheet are returned as
/// errors and left out.
fn resolve_sheets<'a>(
    rules: &'a [CompiledRule],
    available: &[String],
) -> (Vec<SheetRule<'a>>, Vec<ConfigError>) {
    let mut errors = Vec::new();
    let mut resolved = Vec::with_capacity(rules.len());
    for rule in rules {
        match excel_read::resolve_sheet_name(available, &rule.sheet) {
            Some(sheet) => resolved.push(SheetRule { rule, sheet }),
            None => errors.push(ConfigError::UnknownSheet {
                rule: rule.label.clone(),
                sheet: rule.sheet.clone(),
            }),
        }
    }
    (resolved, errors)
}

/// Binds every rule to its sheet and rejects duplicate keys. Violations are
/// appended to `errors` and reported together.
fn validate(
    rules: &[SheetRule<'_>],
    tables: &HashMap<String, SheetTable>,
    mut errors: Vec<ConfigError>,
) -> Result<Vec<Binding>> {
    let mut bindings = Vec::with_capacity(rules.len());
    let mut checked: HashSet<(String, usize)> = HashSet::new();

    for sheet_rule in rules {
        let Some(table) = tables.get(&sheet_rule.sheet) else {
            errors.push(ConfigError::UnknownSheet {
                rule: sheet_rule.rule.label.clone(),
                sheet: sheet_rule.sheet.clone(),
            });
            continue;
        };
        match extract::bind(sheet_rule.rule, table) {
            Ok(binding) => {
                if checked.insert((sheet_rule.sheet.clone(), binding.key)) {
                    errors.extend(extract::check_unique_keys(
                        table,
                        binding.key,
                        &sheet_rule.rule.key.column,
                    ));
                }
                bindings.push(binding);
            }
            Err(unknown) => errors.extend(unknown),
        }
    }

    if !errors.is_empty() {
        warn!(errors = errors.len(), "workbook validation failed");
    }
    ConfigErrors(errors).into_result()?;
    Ok(bindings)
}

fn run_normal(
    workbook: &mut Workbook,
    rules: &[SheetRule<'_>],
    pending: Vec<ConfigError>,
    files: &[XmlFile],
    options: &RunOptions,
) -> Result<RunReport> {
    // Pre-pass: headers plus key columns only.
    let mut key_columns: HashMap<&str, Vec<ColumnRef>> = HashMap::new();
    for sheet_rule in rules {
        key_columns
            .entry(sheet_rule.sheet.as_str())
            .or_default()
            .push(sheet_rule.rule.key.column.clone());
    }
    let mut tables = HashMap::new();
    for (sheet, columns) in &key_columns {
        tables.insert(sheet.to_string(), excel_read::stream_sheet(workbook, sheet, columns)?);
    }
    let bindings = validate(rules, &tables, pending)?;
    drop(tables);

    let mut builder = ReportBuilder::new();
    for file in files {
        if options.cancel.is_cancelled() {
            warn!(file = %file.relative, "run cancelled");
            builder.cancelled();
            break;
        }
        let targeting: Vec<usize> = (0..rules.len())
            .filter(|index| rules[*index].rule.matches_file(&file.relative))
            .collect();
        if targeting.is_empty() {
            debug!(file = %file.relative, "no rule targets file");
            continue;
        }

        let source = match fs::read_to_string(&file.path) {
            Ok(source) => source,
            Err(err) => {
                warn!(file = %file.relative, error = %err, "failed to read xml file");
                let issue = Issue::file(IssueKind::Io, err.to_string());
                builder.file(FileReport::failed(&file.relative, issue));
                continue;
            }
        };

        let mut prepared: Vec<RuleRows> = Vec::with_capacity(targeting.len());
        for index in &targeting {
            let sheet_rule = &rules[*index];
            let columns: Vec<ColumnRef> = sheet_rule.rule.columns().cloned().collect();
            let table = excel_read::stream_sheet(workbook, &sheet_rule.sheet, &columns)?;
            let rows = extract::rule_rows(sheet_rule.rule, &bindings[*index], &table);
            builder.workbook_issues(&rows.issues);
            prepared.push(rows);
        }
        let inputs: Vec<(&CompiledRule, &RuleRows)> = targeting
            .iter()
            .zip(&prepared)
            .map(|(index, rows)| (rules[*index].rule, rows))
            .collect();

        let mut processed = process_document(file, source, &inputs);
        if let Some(output) = processed.output.take() {
            commit(file, &output, &mut processed.report);
        }
        builder.file(processed.report);
    }
    Ok(builder.finish())
}

fn run_quick(
    workbook: &mut Workbook,
    rules: &[SheetRule<'_>],
    pending: Vec<ConfigError>,
    files: &[XmlFile],
    all_or_nothing: bool,
    options: &RunOptions,
) -> Result<RunReport> {
    let mut tables = HashMap::new();
    for sheet_rule in rules {
        if !tables.contains_key(&sheet_rule.sheet) {
            let table = excel_read::load_sheet(workbook, &sheet_rule.sheet)?;
            tables.insert(sheet_rule.sheet.clone(), table);
        }
    }
    let bindings = validate(rules, &tables, pending)?;

    let mut builder = ReportBuilder::new();
    let mut prepared = Vec::with_capacity(rules.len());
    for (sheet_rule, binding) in rules.iter().zip(&bindings) {
        let rows = match tables.get(&sheet_rule.sheet) {
            Some(table) => extract::rule_rows(sheet_rule.rule, binding, table),
            None => RuleRows::default(),
        };
        builder.workbook_issues(&rows.issues);
        prepared.push(rows);
    }
    drop(tables);

    let results: Vec<Option<(usize, Processed)>> = files
        .par_iter()
        .enumerate()
        .map(|(position, file)| {
            if options.cancel.is_cancelled() {
                return None;
            }
            let inputs: Vec<(&CompiledRule, &RuleRows)> = rules
                .iter()
                .zip(&prepared)
                .filter(|(sheet_rule, _)| sheet_rule.rule.matches_file(&file.relative))
                .map(|(sheet_rule, rows)| (sheet_rule.rule, rows))
                .collect();
            if inputs.is_empty() {
                return None;
            }
            let processed = match fs::read_to_string(&file.path) {
                Ok(source) => process_document(file, source, &inputs),
                Err(err) => Processed {
                    report: FileReport::failed(
                        &file.relative,
                        Issue::file(IssueKind::Io, err.to_string()),
                    ),
                    output: None,
                },
            };
            Some((position, processed))
        })
        .collect();

    let processed: Vec<(usize, Processed)> = results.into_iter().flatten().collect();
    let any_failed = processed
        .iter()
        .any(|(_, item)| item.report.status == FileStatus::Failed);
    let withhold = all_or_nothing && any_failed;
    if withhold {
        warn!("withholding all writes because a file failed");
    }

    for (position, mut item) in processed {
        let file = &files[position];
        if options.cancel.is_cancelled() {
            warn!(file = %file.relative, "run cancelled");
            break;
        }
        if let Some(output) = item.output.take() {
            if withhold {
                item.report.fail(Issue::file(
                    IssueKind::Io,
                    "write withheld because another file failed",
                ));
            } else {
                commit(file, &output, &mut item.report);
            }
        }
        builder.file(item.report);
    }
    if options.cancel.is_cancelled() {
        builder.cancelled();
    }
    Ok(builder.finish())
}

/// Parses, plans and applies one document without touching the disk.
fn process_document(
    file: &XmlFile,
    source: String,
    inputs: &[(&CompiledRule, &RuleRows)],
) -> Processed {
    let mut report = FileReport::new(&file.relative);
    let mut document = match XmlDocument::parse(&file.path, source) {
        Ok(document) => document,
        Err(err) => {
            warn!(file = %file.relative, error = %err, "failed to parse xml file");
            report.fail(Issue::file(IssueKind::XmlParse, err.to_string()));
            return Processed { report, output: None };
        }
    };

    let plan = compute_plan(&document, inputs);
    let counts = apply_plan(&mut document, &plan);
    report.inserted = counts.inserted;
    report.updated = counts.updated;
    report.deleted = counts.deleted;
    report.skipped = plan.skipped;
    report.issues = plan.issues;

    let output = document
        .is_modified()
        .then(|| document.serialize())
        .filter(|output| output != document.source());
    let changed = output.is_some();
    debug!(
        file = %file.relative,
        inserted = counts.inserted,
        updated = counts.updated,
        deleted = counts.deleted,
        changed,
        "planned file"
    );
    if changed {
        report.status = FileStatus::Updated;
    }
    Processed { report, output }
}

fn commit(file: &XmlFile, output: &str, report: &mut FileReport) {
    match xml_write::write_atomic(&file.path, output) {
        Ok(()) => info!(
            file = %file.relative,
            operations = report.operations(),
            "updated xml file"
        ),
        Err(err) => {
            warn!(file = %file.relative, error = %err, "failed to write xml file");
            report.fail(Issue::file(IssueKind::Io, err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn empty_sheet_name_resolves_to_first_sheet() {
        let config = Config::from_json(
            r#"{ "rules": [
                { "files": "a.xml", "path": "/a/b", "key": { "column": 0, "target": "@id" } },
                { "name": "other", "sheet": "Missing", "files": "a.xml", "path": "/a/b",
                  "key": { "column": 0, "target": "@id" } }
            ] }"#,
        )
        .expect("parsed");
        let rules = config.compile().expect("compiled");
        let available = vec!["Items".to_string()];

        let (resolved, errors) = resolve_sheets(&rules, &available);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].sheet, "Items");
        assert_eq!(
            errors,
            vec![ConfigError::UnknownSheet {
                rule: "other".into(),
                sheet: "Missing".into(),
            }]
        );
    }
}
