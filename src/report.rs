//! Run outcome reporting.
//!
//! [`ReportBuilder`] collects per-file outcomes and workbook issues while a
//! run progresses; [`ReportBuilder::finish`] is the only way to obtain the
//! final [`RunReport`].

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::model::RowIssue;

/// Category of a recorded problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    WorkbookExtraction,
    XmlParse,
    MappingPolicy,
    Io,
}

/// A row- or file-level problem that did not abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn file(kind: IssueKind, message: impl Into<String>) -> Self {
        Issue {
            kind,
            rule: None,
            key: None,
            message: message.into(),
        }
    }

    pub fn row(kind: IssueKind, rule: &str, key: &str, message: impl Into<String>) -> Self {
        Issue {
            kind,
            rule: Some(rule.to_string()),
            key: Some(key.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(rule) = &self.rule {
            write!(f, " [rule {rule}")?;
            if let Some(key) = &self.key {
                write!(f, ", key '{key}'")?;
            }
            write!(f, "]")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// A row without a matching node that was left alone by `onMissing: skip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Skip {
    pub rule: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileStatus {
    Unchanged,
    Updated,
    Failed,
}

/// Outcome for one XML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    /// Path relative to the XML directory, `/`-separated.
    pub path: String,
    pub status: FileStatus,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: Vec<Skip>,
    pub issues: Vec<Issue>,
}

impl FileReport {
    pub fn new(path: impl Into<String>) -> Self {
        FileReport {
            path: path.into(),
            status: FileStatus::Unchanged,
            inserted: 0,
            updated: 0,
            deleted: 0,
            skipped: Vec::new(),
            issues: Vec::new(),
        }
    }

    /// Marks the file failed with a single file-level issue.
    pub fn failed(path: impl Into<String>, issue: Issue) -> Self {
        let mut report = FileReport::new(path);
        report.fail(issue);
        report
    }

    /// Marks the file failed; counts are reset since nothing was written.
    pub fn fail(&mut self, issue: Issue) {
        self.status = FileStatus::Failed;
        self.inserted = 0;
        self.updated = 0;
        self.deleted = 0;
        self.issues.push(issue);
    }

    pub fn operations(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub files: usize,
    pub files_updated: usize,
    pub files_failed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// Aggregated result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    pub cancelled: bool,
    pub totals: Totals,
    pub files: Vec<FileReport>,
    pub workbook_issues: Vec<RowIssue>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Accumulates outcomes in discovery order.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    files: Vec<FileReport>,
    workbook_issues: BTreeSet<RowIssue>,
    cancelled: bool,
}

impl ReportBuilder {
    pub fn new() -> Self {
        ReportBuilder::default()
    }

    /// Records workbook issues; the same row issue reported for several files
    /// is kept once.
    pub fn workbook_issues<'a>(&mut self, issues: impl IntoIterator<Item = &'a RowIssue>) {
        self.workbook_issues.extend(issues.into_iter().cloned());
    }

    pub fn file(&mut self, report: FileReport) {
        self.files.push(report);
    }

    pub fn cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn finish(self) -> RunReport {
        let mut totals = Totals {
            files: self.files.len(),
            ..Totals::default()
        };
        let mut policy_failure = false;
        for file in &self.files {
            match file.status {
                FileStatus::Updated => totals.files_updated += 1,
                FileStatus::Failed => totals.files_failed += 1,
                FileStatus::Unchanged => {}
            }
            totals.inserted += file.inserted;
            totals.updated += file.updated;
            totals.deleted += file.deleted;
            totals.skipped += file.skipped.len();
            policy_failure |= file
                .issues
                .iter()
                .any(|issue| issue.kind == IssueKind::MappingPolicy);
        }
        let status = if totals.files_failed > 0 || policy_failure || self.cancelled {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        RunReport {
            status,
            cancelled: self.cancelled,
            totals,
            files: self.files,
            workbook_issues: self.workbook_issues.into_iter().collect(),
        }
    }
}
