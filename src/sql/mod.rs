//! The SQL execution boundary.
//!
//! Queries leave the process through a [`SqlGateway`]; the production gateway
//! posts them to the workbench's SQL service over HTTP.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::{Instance, Keyword};
use crate::AppError;

pub mod builder;
pub mod ident;

pub use ident::TableRef;

/// One result row, keyed by column alias.
pub type Row = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("SQL endpoint unreachable: {0}")]
    Transient(String),
    #[error("query rejected: {0}")]
    Rejected(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("unexpected result shape: {0}")]
    Decode(String),
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let code = match &err {
            QueryError::Transient(_) => AppError::QUERY_TRANSIENT,
            QueryError::Rejected(_) => AppError::QUERY_REJECTED,
            QueryError::InvalidIdentifier(_) => "QUERY/INVALID_IDENTIFIER",
            QueryError::Decode(_) => "QUERY/DECODE",
        };
        AppError::new(code, err.to_string())
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            QueryError::Decode(err.to_string())
        } else {
            QueryError::Transient(err.to_string())
        }
    }
}

/// Connection descriptor sent with every statement.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConfig {
    pub server: String,
    pub database: String,
    pub table: String,
    pub user: String,
    pub password: String,
}

impl SqlConfig {
    pub fn for_instance(instance: &Instance) -> Self {
        Self {
            server: instance.server.clone(),
            database: instance.database.clone(),
            table: instance.table.clone(),
            user: instance.sql_credentials.user.clone(),
            password: instance.sql_credentials.password.clone(),
        }
    }
}

impl fmt::Debug for SqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConfig")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("table", &self.table)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// What a statement is for. Carried for logging and for test doubles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    ColumnLookup(String),
    NumericTotals,
    GroupCount(Keyword),
    MappingRows(Keyword),
    DistinctValues(&'static str),
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::ColumnLookup(pattern) => write!(f, "column_lookup:{pattern}"),
            QueryKind::NumericTotals => f.write_str("numeric_totals"),
            QueryKind::GroupCount(keyword) => write!(f, "group_count:{keyword}"),
            QueryKind::MappingRows(keyword) => write!(f, "mapping_rows:{keyword}"),
            QueryKind::DistinctValues(column) => write!(f, "distinct:{column}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlParam {
    pub name: String,
    pub value: Value,
}

/// Statement text plus named parameters (`@name`).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub kind: QueryKind,
    pub text: String,
    pub params: Vec<SqlParam>,
}

impl SqlQuery {
    pub fn new(kind: QueryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.push(SqlParam {
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .map(|param| &param.value)
    }
}

pub trait SqlGateway: Send + Sync {
    fn execute<'a>(
        &'a self,
        config: &'a SqlConfig,
        query: &'a SqlQuery,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>>;
}

/// Posts statements to `<endpoint>/sql/execute`.
#[derive(Debug, Clone)]
pub struct HttpSqlGateway {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: String,
}

impl HttpSqlGateway {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| QueryError::Transient(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, config: &SqlConfig, query: &SqlQuery) -> Result<Vec<Row>, QueryError> {
        let body = json!({
            "config": config,
            "query": query.text,
            "params": query.params,
        });
        let response = self
            .client
            .post(format!("{}/sql/execute", self.endpoint))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let parsed: ExecuteResponse = response.json().await?;
            return Ok(parsed.rows);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(text);
        match status.as_u16() {
            502..=504 => Err(QueryError::Transient(format!("{status}: {message}"))),
            _ => Err(QueryError::Rejected(format!("{status}: {message}"))),
        }
    }
}

impl SqlGateway for HttpSqlGateway {
    fn execute<'a>(
        &'a self,
        config: &'a SqlConfig,
        query: &'a SqlQuery,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>> {
        Box::pin(self.post(config, query))
    }
}

/// Reads a numeric cell. SQL Server decimals may arrive as strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
