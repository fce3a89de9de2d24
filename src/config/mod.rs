//! Declarative mapping configuration.
//!
//! A configuration is a JSON document holding an ordered list of
//! [`Rule`]s. [`Config::from_json`] parses it and [`Config::compile`] runs the
//! schema validation that does not need the workbook, producing the
//! [`CompiledRule`]s the rest of the pipeline works with. Validation is
//! exhaustive: every rule is checked and all violations are returned together.

pub mod path;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigErrors};
use crate::io::xml_doc::XmlDocument;

pub use path::{ElementPath, Target};

/// Schema version understood by this crate.
pub const CONFIG_VERSION: u32 = 1;

/// Default date rendering for `date` fields.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Directory names skipped while discovering XML files.
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
    /// In quick mode, withhold every write when any file fails.
    #[serde(default)]
    pub all_or_nothing: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: CONFIG_VERSION,
            ignore_dirs: default_ignore_dirs(),
            all_or_nothing: false,
            rules: vec![Rule::example()],
        }
    }
}

/// Binding of workbook columns to XML locations for one sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sheet name; empty selects the first sheet.
    #[serde(default)]
    pub sheet: String,
    /// Glob pattern matched against file paths relative to the XML directory.
    pub files: String,
    /// Element path of the candidate nodes, e.g. `/resources/string`.
    pub path: String,
    pub key: KeySpec,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// XML snippet used as the skeleton of inserted nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub on_missing: OnMissing,
    #[serde(default)]
    pub on_extra: OnExtra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySpec {
    pub column: ColumnRef,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub column: ColumnRef,
    pub target: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub on_empty: OnEmpty,
    #[serde(default)]
    pub escape_newlines: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
}

/// Column reference, either by header text or by 0-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Index(index) => write!(f, "#{index}"),
            ColumnRef::Name(name) => write!(f, "'{name}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    Date,
}

/// Behaviour when a row has no matching node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    Insert,
    #[default]
    Skip,
    Error,
}

/// Behaviour when a node has no matching row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExtra {
    Delete,
    #[default]
    Keep,
}

/// Behaviour for empty cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnEmpty {
    #[default]
    Keep,
    Clear,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_ignore_dirs() -> Vec<String> {
    vec!["build".to_string()]
}

fn default_true() -> bool {
    true
}

/// Rule with its expressions parsed and checked.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub label: String,
    pub sheet: String,
    pub files: glob::Pattern,
    pub path: ElementPath,
    pub key: CompiledKey,
    pub fields: Vec<CompiledField>,
    pub template: Option<String>,
    pub on_missing: OnMissing,
    pub on_extra: OnExtra,
}

#[derive(Debug, Clone)]
pub struct CompiledKey {
    pub column: ColumnRef,
    pub target: Target,
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub column: ColumnRef,
    pub target: Target,
    pub value_type: ValueType,
    pub on_empty: OnEmpty,
    pub escape_newlines: bool,
    pub date_format: String,
}

impl CompiledRule {
    /// Columns this rule reads, key first.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnRef> {
        std::iter::once(&self.key.column).chain(self.fields.iter().map(|field| &field.column))
    }

    /// Whether the rule targets the file at `relative` (relative to the XML
    /// directory, `/`-separated). Patterns without a `/` also match the file
    /// name at any depth.
    pub fn matches_file(&self, relative: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.files.matches_with(relative, options) {
            return true;
        }
        if !self.files.as_str().contains('/') {
            let file_name = relative.rsplit('/').next().unwrap_or(relative);
            return self.files.matches_with(file_name, options);
        }
        false
    }
}

impl Config {
    /// Parses a configuration document.
    ///
    /// Rules are deserialised one by one so that every malformed rule is
    /// reported, not only the first.
    pub fn from_json(json: &str) -> Result<Config, ConfigErrors> {
        let (config, errors) = Config::from_json_partial(json)?;
        ConfigErrors(errors).into_result()?;
        Ok(config)
    }

    /// Parses a configuration document, keeping the well-formed rules next
    /// to the violations found in the others. Only a document that is not a
    /// configuration object at all is rejected outright.
    pub fn from_json_partial(json: &str) -> Result<(Config, Vec<ConfigError>), ConfigErrors> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawConfig {
            #[serde(default = "default_version")]
            version: u32,
            #[serde(default = "default_ignore_dirs")]
            ignore_dirs: Vec<String>,
            #[serde(default)]
            all_or_nothing: bool,
            #[serde(default)]
            rules: Vec<Value>,
        }

        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|err| ConfigError::MalformedSchema(err.to_string()))?;

        let mut errors = Vec::new();
        if raw.version != CONFIG_VERSION {
            errors.push(ConfigError::MalformedSchema(format!(
                "unsupported configuration version {}",
                raw.version
            )));
        }

        let mut rules = Vec::with_capacity(raw.rules.len());
        for (index, value) in raw.rules.into_iter().enumerate() {
            match serde_json::from_value::<Rule>(value) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    errors.push(ConfigError::MalformedSchema(format!("rule #{index}: {err}")))
                }
            }
        }

        let config = Config {
            version: raw.version,
            ignore_dirs: raw.ignore_dirs,
            all_or_nothing: raw.all_or_nothing,
            rules,
        };
        Ok((config, errors))
    }

    /// Serialises the configuration as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Validates every enabled rule and returns them compiled.
    pub fn compile(&self) -> Result<Vec<CompiledRule>, ConfigErrors> {
        let (compiled, errors) = self.compile_partial();
        ConfigErrors(errors).into_result()?;
        Ok(compiled)
    }

    /// Compiles the enabled rules that are valid and collects the violations
    /// of the rest, so later checks can still run on the valid ones.
    pub fn compile_partial(&self) -> (Vec<CompiledRule>, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let mut compiled = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.enabled {
                continue;
            }
            if let Some(rule) = compile_rule(index, rule, &mut errors) {
                compiled.push(rule);
            }
        }
        (compiled, errors)
    }
}

impl Rule {
    /// Disabled sample rule shipped in the default configuration, showing
    /// the shape of a rule with the default policies.
    pub fn example() -> Rule {
        Rule {
            name: Some("example".to_string()),
            enabled: false,
            sheet: String::new(),
            files: "values/strings.xml".to_string(),
            path: "/resources/string".to_string(),
            key: KeySpec {
                column: ColumnRef::Name("key".to_string()),
                target: "@name".to_string(),
            },
            fields: vec![FieldSpec {
                column: ColumnRef::Name("text".to_string()),
                target: ".".to_string(),
                value_type: ValueType::String,
                on_empty: OnEmpty::Keep,
                escape_newlines: false,
                date_format: None,
            }],
            template: None,
            on_missing: OnMissing::Skip,
            on_extra: OnExtra::Keep,
        }
    }

    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("#{index}"),
        }
    }
}

fn compile_rule(index: usize, rule: &Rule, errors: &mut Vec<ConfigError>) -> Option<CompiledRule> {
    let label = rule.label(index);
    let before = errors.len();

    let invalid_path = |expression: &str, reason: String| ConfigError::InvalidPathExpression {
        rule: label.clone(),
        expression: expression.to_string(),
        reason,
    };

    let files = if rule.files.trim().is_empty() {
        errors.push(ConfigError::MalformedSchema(format!(
            "rule '{label}': 'files' must not be empty"
        )));
        None
    } else {
        match glob::Pattern::new(rule.files.trim()) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                errors.push(ConfigError::MalformedSchema(format!(
                    "rule '{label}': invalid file pattern '{}': {err}",
                    rule.files
                )));
                None
            }
        }
    };

    let path = match rule.path.parse::<ElementPath>() {
        Ok(path) => Some(path),
        Err(reason) => {
            errors.push(invalid_path(&rule.path, reason));
            None
        }
    };

    let key_target = match rule.key.target.parse::<Target>() {
        Ok(target) => Some(target),
        Err(reason) => {
            errors.push(invalid_path(&rule.key.target, reason));
            None
        }
    };

    let mut fields = Vec::with_capacity(rule.fields.len());
    for field in &rule.fields {
        let target = match field.target.parse::<Target>() {
            Ok(target) => target,
            Err(reason) => {
                errors.push(invalid_path(&field.target, reason));
                continue;
            }
        };
        if key_target.as_ref() == Some(&target) {
            errors.push(ConfigError::MalformedSchema(format!(
                "rule '{label}': field target '{target}' is also the key target"
            )));
            continue;
        }
        if fields.iter().any(|other: &CompiledField| other.target == target) {
            errors.push(ConfigError::MalformedSchema(format!(
                "rule '{label}': target '{target}' is mapped more than once"
            )));
            continue;
        }
        if let Some(format) = &field.date_format {
            if field.value_type != ValueType::Date {
                errors.push(ConfigError::MalformedSchema(format!(
                    "rule '{label}': 'dateFormat' is only valid on date fields"
                )));
                continue;
            }
            if format.trim().is_empty() {
                errors.push(ConfigError::MalformedSchema(format!(
                    "rule '{label}': 'dateFormat' must not be empty"
                )));
                continue;
            }
        }
        fields.push(CompiledField {
            column: field.column.clone(),
            target,
            value_type: field.value_type,
            on_empty: field.on_empty,
            escape_newlines: field.escape_newlines,
            date_format: field
                .date_format
                .clone()
                .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
        });
    }

    if let (Some(template), Some(path)) = (&rule.template, &path) {
        if let Err(reason) = check_template(template, path.item()) {
            errors.push(ConfigError::MalformedSchema(format!(
                "rule '{label}': invalid template: {reason}"
            )));
        }
    }

    if errors.len() != before {
        return None;
    }

    Some(CompiledRule {
        label,
        sheet: rule.sheet.trim().to_string(),
        files: files?,
        path: path?,
        key: CompiledKey {
            column: rule.key.column.clone(),
            target: key_target?,
        },
        fields,
        template: rule.template.clone(),
        on_missing: rule.on_missing,
        on_extra: rule.on_extra,
    })
}

fn check_template(template: &str, item: &str) -> Result<(), String> {
    let document = XmlDocument::parse_str(template).map_err(|err| err.to_string())?;
    let roots = document.root_elements();
    match roots.as_slice() {
        [root] if document.name(*root) == Some(item) => Ok(()),
        [root] => Err(format!(
            "root element '{}' does not match '{item}'",
            document.name(*root).unwrap_or_default()
        )),
        _ => Err("template must contain exactly one root element".to_string()),
    }
}
