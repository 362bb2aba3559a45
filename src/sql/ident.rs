//! Identifier handling for dynamically built statements.
//!
//! Table and column names cannot travel as parameters, so they are checked
//! against an allow-list and bracket-quoted before they reach statement text.

use once_cell::sync::Lazy;
use regex::Regex;

use super::QueryError;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_@#][A-Za-z0-9_@#$ \-]{0,127}$").expect("identifier pattern compiles")
});

pub fn is_valid_ident(name: &str) -> bool {
    IDENT_RE.is_match(name) && name.trim() == name
}

pub fn validate_ident(name: &str) -> Result<&str, QueryError> {
    if is_valid_ident(name) {
        Ok(name)
    } else {
        Err(QueryError::InvalidIdentifier(name.to_string()))
    }
}

/// `[name]`, with `]` doubled.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Validated, quoted identifier.
pub fn quoted(name: &str) -> Result<String, QueryError> {
    validate_ident(name).map(quote_ident)
}

/// Escapes `LIKE` metacharacters and wraps the text as a substring match.
pub fn like_contains(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '[' => escaped.push_str("[[]"),
            '%' => escaped.push_str("[%]"),
            '_' => escaped.push_str("[_]"),
            other => escaped.push(other),
        }
    }
    format!("%{escaped}%")
}

/// A possibly schema-qualified table name (`dbo.Claims` or `Claims`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: validate_ident(name)?.to_string(),
            }),
            [schema, name] => Ok(Self {
                schema: Some(validate_ident(schema)?.to_string()),
                name: validate_ident(name)?.to_string(),
            }),
            _ => Err(QueryError::InvalidIdentifier(raw.to_string())),
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}
