//! Path expressions locating candidate elements and the targets read and
//! written on them.
//!
//! The grammar is deliberately small:
//!
//! * element path: `/resources/string`, at least two segments; the last
//!   segment names the candidate element, the others its container chain.
//! * target: `.` (element text), `@attr`, `child` or `child/@attr`.

use std::fmt;
use std::str::FromStr;

/// Absolute path to the candidate elements of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementPath {
    container: Vec<String>,
    item: String,
}

impl ElementPath {
    /// Element names from the document root down to the container.
    pub fn container(&self) -> &[String] {
        &self.container
    }

    /// Name of the candidate element inside the container.
    pub fn item(&self) -> &str {
        &self.item
    }
}

impl FromStr for ElementPath {
    type Err = String;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let trimmed = expression.trim();
        let body = trimmed
            .strip_prefix('/')
            .ok_or_else(|| "path must start with '/'".to_string())?;
        let mut segments = Vec::new();
        for segment in body.split('/') {
            if !is_xml_name(segment) {
                return Err(format!("'{segment}' is not a valid element name"));
            }
            segments.push(segment.to_string());
        }
        if segments.len() < 2 {
            return Err("path needs a container and an element segment".to_string());
        }
        let item = segments.pop().unwrap_or_default();
        Ok(ElementPath {
            container: segments,
            item,
        })
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.container {
            write!(f, "/{segment}")?;
        }
        write!(f, "/{}", self.item)
    }
}

/// Value location relative to a candidate element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Text content of the element itself.
    Text,
    /// Attribute of the element.
    Attribute(String),
    /// Text content of the first child element with the given name.
    ChildText(String),
    /// Attribute of the first child element with the given name.
    ChildAttribute { child: String, attribute: String },
}

impl FromStr for Target {
    type Err = String;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let trimmed = expression.trim();
        if trimmed == "." || trimmed == "text()" {
            return Ok(Target::Text);
        }
        if let Some(attribute) = trimmed.strip_prefix('@') {
            return if is_xml_name(attribute) {
                Ok(Target::Attribute(attribute.to_string()))
            } else {
                Err(format!("'{attribute}' is not a valid attribute name"))
            };
        }
        match trimmed.split_once('/') {
            None if is_xml_name(trimmed) => Ok(Target::ChildText(trimmed.to_string())),
            None => Err(format!("'{trimmed}' is not a valid element name")),
            Some((child, rest)) => {
                if !is_xml_name(child) {
                    return Err(format!("'{child}' is not a valid element name"));
                }
                match rest.strip_prefix('@') {
                    Some(attribute) if is_xml_name(attribute) => Ok(Target::ChildAttribute {
                        child: child.to_string(),
                        attribute: attribute.to_string(),
                    }),
                    Some(attribute) => Err(format!("'{attribute}' is not a valid attribute name")),
                    None if rest == "text()" => Ok(Target::ChildText(child.to_string())),
                    None => Err("only one level of child element is supported".to_string()),
                }
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Text => write!(f, "."),
            Target::Attribute(name) => write!(f, "@{name}"),
            Target::ChildText(child) => write!(f, "{child}"),
            Target::ChildAttribute { child, attribute } => write!(f, "{child}/@{attribute}"),
        }
    }
}

/// Loose XML `Name` production check, enough to reject typos and
/// expression syntax this crate does not understand.
fn is_xml_name(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_alphanumeric() || matches!(ch, '_' | ':' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_element_path() {
        let path: ElementPath = "/resources/string".parse().expect("valid path");
        assert_eq!(path.container(), ["resources".to_string()]);
        assert_eq!(path.item(), "string");
        assert_eq!(path.to_string(), "/resources/string");
    }

    #[test]
    fn rejects_short_or_relative_paths() {
        assert!("/items".parse::<ElementPath>().is_err());
        assert!("items/item".parse::<ElementPath>().is_err());
        assert!("/items//item".parse::<ElementPath>().is_err());
        assert!("/items/item[@id='1']".parse::<ElementPath>().is_err());
    }

    #[test]
    fn parses_targets() {
        assert_eq!(".".parse::<Target>(), Ok(Target::Text));
        assert_eq!("@id".parse::<Target>(), Ok(Target::Attribute("id".into())));
        assert_eq!("name".parse::<Target>(), Ok(Target::ChildText("name".into())));
        assert_eq!(
            "price/@currency".parse::<Target>(),
            Ok(Target::ChildAttribute {
                child: "price".into(),
                attribute: "currency".into()
            })
        );
        assert!("a/b/c".parse::<Target>().is_err());
        assert!("@1x".parse::<Target>().is_err());
    }
}
