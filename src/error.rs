use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Error type covering the failures that abort a synchronisation run or a
/// single file operation.
///
/// Row- and file-level problems that must not stop the run are recorded as
/// [`Issue`](crate::report::Issue) values instead.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Wrapper for IO failures such as reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised when JSON parsing or serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors bubbled up from the Excel reader implementation.
    #[error("Excel read error: {0}")]
    ExcelRead(#[from] calamine::XlsxError),

    /// One or more configuration violations, reported together.
    #[error(transparent)]
    Config(#[from] ConfigErrors),

    /// Raised when boundary input is not valid UTF-8.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Raised when an XML file cannot be parsed.
    #[error(transparent)]
    XmlParse(#[from] XmlParseError),

    /// Raised when writing an XML document back to disk fails.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Raised when the user provides a path that does not exist.
    #[error("input not found: {0}")]
    MissingInput(PathBuf),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

/// A single configuration violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    MalformedSchema(String),

    #[error("rule '{rule}' references unknown sheet '{sheet}'")]
    UnknownSheet { rule: String, sheet: String },

    #[error("rule '{rule}' references unknown column {column} in sheet '{sheet}'")]
    UnknownColumn {
        rule: String,
        sheet: String,
        column: String,
    },

    #[error(
        "duplicate key '{key}' in column {column} of sheet '{sheet}' \
         (rows {first_row} and {second_row})"
    )]
    DuplicateKeyColumn {
        sheet: String,
        column: String,
        key: String,
        first_row: u32,
        second_row: u32,
    },

    #[error("rule '{rule}' has invalid path expression '{expression}': {reason}")]
    InvalidPathExpression {
        rule: String,
        expression: String,
        reason: String,
    },
}

/// Every violation found by an exhaustive validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `Ok` when no violation was collected.
    pub fn into_result(self) -> std::result::Result<(), ConfigErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        ConfigErrors(vec![error])
    }
}

impl From<ConfigError> for ToolError {
    fn from(error: ConfigError) -> Self {
        ToolError::Config(error.into())
    }
}

/// Which boundary argument failed UTF-8 validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingField {
    Config,
    ExcelPath,
    XmlDirPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid UTF-8 in {field:?}")]
pub struct EncodingError {
    pub field: EncodingField,
}

/// Malformed XML in a target file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed XML in {path} at byte {offset}: {message}")]
pub struct XmlParseError {
    pub path: PathBuf,
    pub offset: usize,
    pub message: String,
}
