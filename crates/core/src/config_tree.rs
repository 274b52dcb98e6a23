//! Sectioned experiment configuration: INI parsing and hierarchical
//! resolution.
//!
//! A section named `a.b.c` is a *leaf*. It inherits from the `DEFAULT`
//! section, then from each defined ancestor (`a`, then `a.b`), and finally
//! applies its own keys. Undefined ancestors are skipped.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between path segments in a section name.
pub const SECTION_SEPARATOR: char = '.';

/// Name of the INI section that supplies defaults to every leaf.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// One flat section: option key -> value, in file order.
pub type Section = IndexMap<String, Value>;

/// All named sections, in file order.
pub type Sections = IndexMap<String, Section>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A fully merged configuration for one leaf section.
///
/// Keys are kept sorted so two configs with the same entries are identical
/// regardless of the order their sections were declared in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedConfig(BTreeMap<String, Value>);

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for ResolvedConfig {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Raw configuration as read from an INI document, before any merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    /// Options of the `DEFAULT` section.
    pub defaults: Section,
    /// Every other section, in declaration order.
    pub sections: Sections,
}

impl RawConfig {
    /// Parse an INI document. See [`parse_ini`].
    pub fn parse(text: &str) -> Result<Self, ConfigParseError> {
        parse_ini(text)
    }

    /// Resolve every leaf section. See [`resolve`].
    pub fn resolve(&self) -> IndexMap<String, ResolvedConfig> {
        resolve(&self.sections, &self.defaults)
    }
}

/// Malformed configuration input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{message}", line_prefix(.line))]
pub struct ConfigParseError {
    /// 1-based line number for INI input; `None` for structured input.
    pub line: Option<usize>,
    pub message: String,
}

impl ConfigParseError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    fn structural(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

fn line_prefix(line: &Option<usize>) -> String {
    line.map(|line| format!("line {line}: ")).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an INI document into raw sections.
///
/// Grammar (a strict subset of Python's `configparser` defaults):
/// - `[name]` opens a section; `[DEFAULT]` may appear more than once.
/// - `key = value` or `key: value`; keys are trimmed and lower-cased.
/// - Lines starting with `#` or `;` are comments.
/// - A line indented deeper than the preceding option continues its value.
/// - No interpolation is performed.
pub fn parse_ini(text: &str) -> Result<RawConfig, ConfigParseError> {
    let mut raw = RawConfig::default();
    let mut current: Option<String> = None;
    // (key, indent) of the option a continuation line would extend.
    let mut last_option: Option<(String, usize)> = None;

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            last_option = None;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        let indent = line.len() - line.trim_start().len();

        if let (Some(section_name), Some((key, key_indent))) = (&current, &last_option) {
            if indent > *key_indent {
                let section = section_mut(&mut raw, section_name);
                if let Some(Value::String(value)) = section.get_mut(key) {
                    value.push('\n');
                    value.push_str(trimmed);
                }
                continue;
            }
        }

        if trimmed.starts_with('[') {
            let name = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .ok_or_else(|| ConfigParseError::at(lineno, "unterminated section header"))?;
            if name.is_empty() {
                return Err(ConfigParseError::at(lineno, "empty section name"));
            }
            if name != DEFAULT_SECTION {
                if raw.sections.contains_key(name) {
                    return Err(ConfigParseError::at(
                        lineno,
                        format!("duplicate section '{name}'"),
                    ));
                }
                raw.sections.insert(name.to_string(), Section::new());
            }
            current = Some(name.to_string());
            last_option = None;
            continue;
        }

        let Some(section_name) = &current else {
            return Err(ConfigParseError::at(
                lineno,
                "option found before any section header",
            ));
        };

        let (key, value) = trimmed
            .split_once(|c: char| c == '=' || c == ':')
            .ok_or_else(|| ConfigParseError::at(lineno, "expected 'key = value'"))?;
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(ConfigParseError::at(lineno, "empty option name"));
        }

        let section = section_mut(&mut raw, section_name);
        if section.contains_key(&key) {
            return Err(ConfigParseError::at(
                lineno,
                format!("duplicate option '{key}' in section '{section_name}'"),
            ));
        }
        section.insert(key.clone(), Value::String(value.trim().to_string()));
        last_option = Some((key, indent));
    }

    Ok(raw)
}

fn section_mut<'a>(raw: &'a mut RawConfig, name: &str) -> &'a mut Section {
    if name == DEFAULT_SECTION {
        &mut raw.defaults
    } else {
        raw.sections.entry(name.to_string()).or_default()
    }
}

/// Convert a stored JSON config into a section.
///
/// `null` is treated as an empty section; anything other than an object is
/// malformed.
pub fn section_from_json(value: &Value) -> Result<Section, ConfigParseError> {
    match value {
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Value::Null => Ok(Section::new()),
        other => Err(ConfigParseError::structural(format!(
            "config must be a JSON object, found {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Whether `name` encodes a hierarchical path and is therefore a leaf.
pub fn is_leaf(name: &str) -> bool {
    name.contains(SECTION_SEPARATOR)
}

/// Proper prefixes of `name` at each separator, shortest first.
///
/// `"a.b.c"` yields `["a", "a.b"]`; a name without separators yields nothing.
pub fn ancestor_chain(name: &str) -> Vec<&str> {
    name.char_indices()
        .filter(|&(_, c)| c == SECTION_SEPARATOR)
        .map(|(i, _)| &name[..i])
        .filter(|prefix| !prefix.is_empty())
        .collect()
}

/// Resolve every leaf section in `sections`.
///
/// Non-leaf sections are not part of the output but still act as ancestors.
/// The output keeps declaration order.
pub fn resolve(sections: &Sections, defaults: &Section) -> IndexMap<String, ResolvedConfig> {
    sections
        .iter()
        .filter(|(name, _)| is_leaf(name))
        .map(|(name, leaf)| (name.clone(), resolve_leaf(sections, defaults, name, leaf)))
        .collect()
}

/// Resolve one section named `name` whose own options are `leaf`.
///
/// Merge order: `defaults`, each defined ancestor of `name` (closest last),
/// then `leaf`. `leaf` is passed separately so a caller can resolve options
/// that are not stored in `sections`.
pub fn resolve_leaf(
    sections: &Sections,
    defaults: &Section,
    name: &str,
    leaf: &Section,
) -> ResolvedConfig {
    let mut merged: BTreeMap<String, Value> = defaults
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for ancestor in ancestor_chain(name) {
        if let Some(section) = sections.get(ancestor) {
            merged.extend(section.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    merged.extend(leaf.iter().map(|(k, v)| (k.clone(), v.clone())));
    ResolvedConfig(merged)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
