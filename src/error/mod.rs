use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Error payload handed to the UI. `code` is stable and namespaced
/// (`QUERY/...`, `CACHE/...`, `PERSIST/...`); `message` is display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Keyword, table, tab or column the failure belongs to.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[ts(type = "Record<string, string>")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Network, timeout or connection failure talking to the SQL endpoint.
    pub const QUERY_TRANSIENT: &'static str = "QUERY/TRANSIENT";
    /// The SQL endpoint rejected the statement.
    pub const QUERY_REJECTED: &'static str = "QUERY/REJECTED";
    /// An expected column pattern is missing from the table.
    pub const SCHEMA_MISMATCH: &'static str = "QUERY/SCHEMA_MISMATCH";
    pub const CACHE_FAILURE: &'static str = "CACHE/FAILURE";
    pub const PERSIST_CONFLICT: &'static str = "PERSIST/CONFLICT";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn StdError + 'static))
    }
}

// `AppError -> anyhow::Error` comes from anyhow's blanket impl.
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        fn walk(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            let mut converted = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            converted.cause = err.source().map(|source| Box::new(walk(source)));
            converted
        }
        walk(error.as_ref())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::new(format!("IO/{:?}", error.kind()), error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() { "JSON/DATA" } else { "JSON/SYNTAX" };
        AppError::new(code, error.to_string()).with_context("line", error.line().to_string())
    }
}

/// sqlx only backs the local cache, so every variant lands under `CACHE/`.
impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => AppError::new("CACHE/BUSY", "Cache database is busy"),
            sqlx::Error::PoolClosed => AppError::new("CACHE/CLOSED", "Cache database is closed"),
            sqlx::Error::Io(err) => AppError::new("CACHE/IO", err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("CACHE/SQLITE_{code}"))
                    .unwrap_or_else(|| AppError::CACHE_FAILURE.to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new(AppError::CACHE_FAILURE, other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        let code = if error.is_timeout() || error.is_connect() {
            AppError::QUERY_TRANSIENT
        } else {
            "HTTP/ERROR"
        };
        let converted = AppError::new(code, error.to_string());
        match error.status() {
            Some(status) => converted.with_context("status", status.as_u16().to_string()),
            None => converted,
        }
    }
}
