//! The catalog document: an ordered list of project records, always read and
//! written as one unit.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields holding filesystem paths or URLs.
const PATH_FIELDS: [&str; 2] = ["img", "path"];

/// String values of `"path"` / `"img"` fields, escapes included.
static RAW_PATH_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("(?:path|img)"\s*:\s*")((?:[^"\\]|\\.)*)(")"#).expect("static regex")
});

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed document JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("document must be a JSON array")]
    NotAnArray,
    #[error("record {index} must be a JSON object")]
    NotAnObject { index: usize },
    #[error("failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// One catalog entry.  Only a handful of fields are interpreted; every other
/// field is carried through untouched and in its original order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectRecord(pub Map<String, Value>);

impl ProjectRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn tags(&self) -> Vec<&str> {
        self.0
            .get("tag")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Normalize `img` and `path`.  Returns `true` when anything changed.
    pub fn normalize_paths(&mut self) -> bool {
        let mut changed = false;
        for field in PATH_FIELDS {
            if let Some(Value::String(raw)) = self.0.get_mut(field) {
                let normalized = normalize_stored_path(raw);
                if *raw != normalized {
                    *raw = normalized;
                    changed = true;
                }
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Vec<ProjectRecord>);

impl Document {
    pub fn new(records: Vec<ProjectRecord>) -> Self {
        Self(records)
    }

    pub fn records(&self) -> &[ProjectRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Strict parse: the text must be a JSON array of objects.
    pub fn from_json_str(text: &str) -> Result<Self, DocumentError> {
        let value = serde_json::from_str::<Value>(text).map_err(DocumentError::Malformed)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Array(items) = value else {
            return Err(DocumentError::NotAnArray);
        };
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(map) => Ok(ProjectRecord(map)),
                _ => Err(DocumentError::NotAnObject { index }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Parse hand-edited documents.  When the strict parse fails on syntax,
    /// stray backslashes inside `path` / `img` values (raw Windows paths) are
    /// escaped and the parse is retried once.
    pub fn parse_lenient(text: &str) -> Result<Self, DocumentError> {
        match Self::from_json_str(text) {
            Err(DocumentError::Malformed(err)) => {
                let repaired = repair_raw_paths(text);
                if repaired == text {
                    return Err(DocumentError::Malformed(err));
                }
                Self::from_json_str(&repaired)
            }
            other => other,
        }
    }

    /// Pretty JSON with two-space indentation: the on-disk form at both
    /// targets.
    pub fn to_json_pretty(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(&self.0).map_err(DocumentError::Serialize)
    }

    /// Normalize stored paths of every record.  Returns `true` when the
    /// document changed and should be written back.
    pub fn normalize_paths(&mut self) -> bool {
        self.0
            .iter_mut()
            .fold(false, |changed, record| record.normalize_paths() || changed)
    }
}

impl From<Vec<ProjectRecord>> for Document {
    fn from(records: Vec<ProjectRecord>) -> Self {
        Self(records)
    }
}

fn repair_raw_paths(text: &str) -> String {
    RAW_PATH_FIELD
        .replace_all(text, |caps: &Captures| {
            format!("{}{}{}", &caps[1], escape_stray_backslashes(&caps[2]), &caps[3])
        })
        .into_owned()
}

fn escape_stray_backslashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some(&next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u')) => {
                out.push('\\');
                out.push(next);
                chars.next();
            }
            _ => out.push_str("\\\\"),
        }
    }
    out
}

fn is_separator(ch: char) -> bool {
    ch == '\\' || ch == '/'
}

fn collapse_separators(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_separator = false;
    for ch in raw.chars() {
        if is_separator(ch) {
            if !last_was_separator {
                out.push('\\');
            }
            last_was_separator = true;
        } else {
            out.push(ch);
            last_was_separator = false;
        }
    }
    out
}

/// Canonical form of a path or URL stored in a record.
///
/// URLs are kept as-is.  UNC paths (`\\server\share`) get exactly two leading
/// backslashes and single backslash separators.  Drive paths (`C:\dir`) get
/// single backslash separators.  Anything else is only trimmed.
pub fn normalize_stored_path(value: &str) -> String {
    let raw = value.trim();
    if raw.is_empty() {
        return String::new();
    }

    let lower = raw.to_ascii_lowercase();
    if ["http:", "https:", "data:", "blob:", "file:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return raw.to_string();
    }

    let mut chars = raw.chars();
    let first = chars.next();
    let second = chars.next();
    let third = chars.next();

    if first.is_some_and(is_separator) && second.is_some_and(is_separator) {
        let rest = raw.trim_start_matches(is_separator);
        return format!("\\\\{}", collapse_separators(rest));
    }

    if first.is_some_and(|c| c.is_ascii_alphabetic())
        && second == Some(':')
        && third.is_some_and(is_separator)
    {
        return collapse_separators(raw);
    }

    raw.to_string()
}
