//! Cache key derivation for upstream requests.
//!
//! Keys are opaque strings. Requests bound for the GraphQL upstream are turned
//! into keys by canonicalizing their payload so that cosmetic differences
//! (indentation, field order inside `variables`) collide on the same key:
//!
//! - query text has every run of whitespace collapsed to a single space
//! - parameter objects are serialized with sorted field names, recursively
//! - the request is classified into a category from its top-level fields
//!
//! The resulting key has the form `{category}:{query}|{variables}` so that
//! invalidation by prefix can target a whole category.
//!
//! ```
//! use serde_json::json;
//! use standings_core::RequestKey;
//!
//! let a = json!({"query": "query { leaderboard { id } }", "variables": {"b": 1, "a": 2}});
//! let b = json!({"variables": {"a": 2, "b": 1}, "query": "query {\n  leaderboard { id }\n}"});
//!
//! let classify = |_: &[smol_str::SmolStr]| Some("leaderboard".into());
//! assert_eq!(RequestKey::derive(&a, classify), RequestKey::derive(&b, classify));
//! ```
//!
//! Derivation is total: a payload that is not an object, or that lacks a
//! query, degrades to an empty placeholder instead of failing.

use std::fmt::{self, Write};

use serde_json::Value;
use smol_str::SmolStr;

/// Category used when a request matches no known shape.
pub const DEFAULT_CATEGORY: &str = "default";

/// A canonical key for an upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    key: SmolStr,
    category: Option<SmolStr>,
    fields: Vec<SmolStr>,
}

impl RequestKey {
    /// Derives the key for a GraphQL-style payload.
    ///
    /// `classify` receives the top-level selection fields of the query and
    /// returns the matching category, or `None` for unrecognized shapes.
    pub fn derive<F>(payload: &Value, classify: F) -> Self
    where
        F: FnOnce(&[SmolStr]) -> Option<SmolStr>,
    {
        let raw_query = payload.get("query").and_then(Value::as_str).unwrap_or_default();
        let query = canonical_query(raw_query);
        let variables = payload
            .get("variables")
            .filter(|v| !v.is_null())
            .map(canonical_json)
            .unwrap_or_else(|| String::from("{}"));
        let operation = payload.get("operationName").and_then(Value::as_str);

        let fields = top_level_fields(raw_query);
        let category = classify(&fields);

        let mut key = String::with_capacity(query.len() + variables.len() + 16);
        key.push_str(category.as_deref().unwrap_or(DEFAULT_CATEGORY));
        key.push(':');
        key.push_str(&query);
        key.push('|');
        key.push_str(&variables);
        if let Some(operation) = operation {
            let _ = write!(key, "|op={operation}");
        }

        Self {
            key: SmolStr::from(key),
            category,
            fields,
        }
    }

    /// The key string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The matched category, `None` when the default applied.
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Top-level fields found in the query.
    pub fn fields(&self) -> &[SmolStr] {
        &self.fields
    }

    /// Consumes the key, returning the key string.
    pub fn into_key(self) -> SmolStr {
        self.key
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<RequestKey> for SmolStr {
    fn from(key: RequestKey) -> Self {
        key.key
    }
}

/// Collapses every run of whitespace to a single space and trims the ends.
pub fn canonical_query(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Serializes a JSON value with object fields sorted by name.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_sorted(value, &mut out);
    out
}

fn write_sorted(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(name.clone()), out);
                out.push(':');
                write_sorted(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_sorted(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display for Value never fails for scalars; it is JSON encoding.
    let _ = write!(out, "{value}");
}

/// Extracts the names of the top-level fields of the first selection set.
///
/// Operation headers, arguments, aliases, directives, fragment spreads and
/// nested selections are skipped. Unbalanced input yields whatever was
/// collected before the scan ran out of characters.
pub fn top_level_fields(query: &str) -> Vec<SmolStr> {
    let mut fields: Vec<SmolStr> = Vec::new();
    let mut chars = query.chars().peekable();
    let mut braces = 0usize;
    let mut parens = 0usize;
    let mut skip_name = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' => parens += 1,
            ')' => parens = parens.saturating_sub(1),
            '{' if parens == 0 => braces += 1,
            '}' if parens == 0 => {
                if braces == 1 {
                    break;
                }
                braces = braces.saturating_sub(1);
            }
            '.' | '@' if braces == 1 && parens == 0 => skip_name = true,
            ':' if braces == 1 && parens == 0 => {
                // `alias: field`; the name before the colon was the alias.
                fields.pop();
            }
            c if is_name_start(c) => {
                let mut name = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_name_continue(next) {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                if braces != 1 || parens != 0 {
                    continue;
                }
                if skip_name {
                    skip_name = name == "on";
                    continue;
                }
                fields.push(SmolStr::from(name));
            }
            _ => {}
        }
    }

    let mut seen = Vec::with_capacity(fields.len());
    for field in fields {
        if !seen.contains(&field) {
            seen.push(field);
        }
    }
    seen
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
