use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::sql::ident::is_valid_ident;
use crate::sql::{builder, QueryError, Row, SqlConfig, SqlGateway, SqlQuery, TableRef};

/// Submits statements through the SQL boundary and logs their outcome.
#[derive(Clone)]
pub struct QueryExecutor {
    gateway: Arc<dyn SqlGateway>,
}

impl QueryExecutor {
    pub fn new(gateway: Arc<dyn SqlGateway>) -> Self {
        Self { gateway }
    }

    pub async fn execute(&self, config: &SqlConfig, query: &SqlQuery) -> Result<Vec<Row>, QueryError> {
        let start = Instant::now();
        match self.gateway.execute(config, query).await {
            Ok(rows) => {
                debug!(
                    target: "waterfall",
                    event = "query_ok",
                    kind = %query.kind,
                    server = %config.server,
                    database = %config.database,
                    table = %config.table,
                    rows = rows.len(),
                    duration_ms = start.elapsed().as_millis() as u64
                );
                Ok(rows)
            }
            Err(err) => {
                warn!(
                    target: "waterfall",
                    event = "query_failed",
                    kind = %query.kind,
                    server = %config.server,
                    database = %config.database,
                    table = %config.table,
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// Column names on `table` containing `pattern`, sorted ordinally and
    /// deduplicated. Names the endpoint returns that do not actually contain
    /// the pattern, or that fail identifier validation, are dropped.
    pub async fn find_columns_matching(
        &self,
        config: &SqlConfig,
        table: &TableRef,
        pattern: &str,
    ) -> Result<Vec<String>, QueryError> {
        let query = builder::column_lookup(table, pattern);
        let rows = self.execute(config, &query).await?;
        let mut names: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row
                .get("COLUMN_NAME")
                .or_else(|| row.values().next())
                .and_then(Value::as_str)
                .ok_or_else(|| QueryError::Decode("column lookup row without a name".into()))?;
            if !name.contains(pattern) {
                continue;
            }
            if !is_valid_ident(name) {
                warn!(
                    target: "waterfall",
                    event = "column_skipped",
                    reason = "invalid_identifier",
                    column = name
                );
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
