#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::subscriber::{self, DefaultGuard};
use tracing_subscriber::{fmt, EnvFilter};

use waterfall_lib::cache::CacheHandle;
use waterfall_lib::model::{Instance, InstanceKey, Keyword, Mapping};
use waterfall_lib::persistence::{MemoryPersistence, PersistError, PersistenceGateway};
use waterfall_lib::projects::Project;
use waterfall_lib::sql::{QueryError, QueryKind, Row, SqlConfig, SqlGateway, SqlQuery};
use waterfall_lib::Workspace;

pub const SERVER: &str = "sql01";
pub const DATABASE: &str = "billing";
pub const USER: &str = "user-1";

/// Raw billing rows plus the column list `INFORMATION_SCHEMA` would report.
#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl FakeTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, values: Value) -> Self {
        self.rows.push(values.as_object().cloned().expect("row fixture is an object"));
        self
    }

    fn group_columns(&self, keyword: Keyword) -> Option<(String, String)> {
        let mut matches: Vec<&String> = self
            .columns
            .iter()
            .filter(|c| c.contains(&keyword.group_field()))
            .collect();
        matches.sort();
        let group_final = matches
            .iter()
            .find(|c| c.contains(&keyword.group_final_field()))?;
        let group = matches.iter().find(|c| !c.contains("_Group_Final"))?;
        Some((group.to_string(), group_final.to_string()))
    }
}

/// In-memory SQL endpoint answering the statements the core builds, computed
/// from raw rows. Supports per-table delays, injected failures and a call log.
#[derive(Default)]
pub struct FakeSqlServer {
    tables: StdMutex<HashMap<String, FakeTable>>,
    delays: StdMutex<HashMap<String, Duration>>,
    failures: StdMutex<HashSet<(String, String)>>,
    calls: StdMutex<Vec<(String, QueryKind)>>,
}

impl FakeSqlServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, table: FakeTable) -> Self {
        self.tables.lock().unwrap().insert(name.to_string(), table);
        self
    }

    pub fn set_delay(&self, table: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(table.to_string(), delay);
    }

    /// Makes every statement of `kind` against `table` fail as unreachable.
    pub fn fail(&self, table: &str, kind: QueryKind) {
        self.failures
            .lock()
            .unwrap()
            .insert((table.to_string(), kind.to_string()));
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<(String, QueryKind)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, kind: &QueryKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k == kind)
            .count()
    }
}

impl SqlGateway for FakeSqlServer {
    fn execute<'a>(
        &'a self,
        config: &'a SqlConfig,
        query: &'a SqlQuery,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((config.table.clone(), query.kind.clone()));
            let delay = self.delays.lock().unwrap().get(&config.table).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let injected = self
                .failures
                .lock()
                .unwrap()
                .contains(&(config.table.clone(), query.kind.to_string()));
            if injected {
                return Err(QueryError::Transient(format!(
                    "injected failure for {}",
                    query.kind
                )));
            }
            let table = self
                .tables
                .lock()
                .unwrap()
                .get(&config.table)
                .cloned()
                .ok_or_else(|| {
                    QueryError::Rejected(format!("Invalid object name '{}'", config.table))
                })?;
            respond(&table, &query.kind)
        })
    }
}

fn num(row: &Row, column: &str) -> f64 {
    row.get(column).and_then(Value::as_f64).unwrap_or(0.0)
}

fn text(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn object(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn respond(table: &FakeTable, kind: &QueryKind) -> Result<Vec<Row>, QueryError> {
    let rows = &table.rows;
    match kind {
        QueryKind::ColumnLookup(pattern) => {
            let mut names: Vec<&String> =
                table.columns.iter().filter(|c| c.contains(pattern.as_str())).collect();
            names.sort();
            Ok(names
                .into_iter()
                .map(|name| object(json!({ "COLUMN_NAME": name })))
                .collect())
        }
        QueryKind::NumericTotals => {
            let sum = |column: &str| -> Value {
                if rows.is_empty() {
                    Value::Null
                } else {
                    json!(rows.iter().map(|r| num(r, column)).sum::<f64>())
                }
            };
            let nonzero = |column: &str| rows.iter().filter(|r| num(r, column) != 0.0).count();
            let periods: BTreeSet<String> = rows.iter().map(|r| text(r, "DOS_Period")).collect();
            Ok(vec![object(json!({
                "total_charge_amount": sum("Charge_Amount"),
                "total_payment_amount": sum("Payment_Amount"),
                "total_units": sum("Units"),
                "charge_count": nonzero("Charge_Amount"),
                "payment_count": nonzero("Payment_Amount"),
                "row_count": rows.len(),
                "period_count": periods.len(),
            }))])
        }
        QueryKind::GroupCount(keyword) => {
            let (group, group_final) = table
                .group_columns(*keyword)
                .ok_or_else(|| QueryError::Rejected("Invalid column name".into()))?;
            let pairs: BTreeSet<(String, String)> = rows
                .iter()
                .map(|r| (text(r, &group_final), text(r, &group)))
                .collect();
            Ok(vec![object(json!({ "count": pairs.len() }))])
        }
        QueryKind::MappingRows(keyword) => {
            let (group, group_final) = table
                .group_columns(*keyword)
                .ok_or_else(|| QueryError::Rejected("Invalid column name".into()))?;
            let mut groups: BTreeMap<(String, String), Vec<&Row>> = BTreeMap::new();
            for row in rows {
                groups
                    .entry((text(row, &group_final), text(row, &group)))
                    .or_default()
                    .push(row);
            }
            Ok(groups
                .into_iter()
                .map(|((final_value, group_value), members)| {
                    let periods: Vec<String> =
                        members.iter().map(|r| text(r, "DOS_Period")).collect();
                    let mut out = Row::new();
                    out.insert(keyword.group_final_field(), json!(final_value));
                    out.insert(keyword.group_field(), json!(group_value));
                    out.insert(
                        "Total_Charge_Amount".into(),
                        json!(members.iter().map(|r| num(r, "Charge_Amount")).sum::<f64>()),
                    );
                    out.insert(
                        "Total_Payment_Amount".into(),
                        json!(members.iter().map(|r| num(r, "Payment_Amount")).sum::<f64>()),
                    );
                    out.insert("Earliest_Min_DOS".into(), json!(periods.iter().min()));
                    out.insert("Latest_Max_DOS".into(), json!(periods.iter().max()));
                    out
                })
                .collect())
        }
        QueryKind::DistinctValues(column) => {
            let values: BTreeSet<String> = rows
                .iter()
                .filter_map(|r| r.get(*column).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            Ok(values
                .into_iter()
                .map(|value| object(json!({ "value": value })))
                .collect())
        }
    }
}

fn claim(
    procedure: (&str, &str),
    provider: (&str, &str),
    insurance: (&str, &str),
    amounts: (f64, f64, f64),
    periods: (&str, &str),
) -> Value {
    json!({
        "Procedure_Group": procedure.0,
        "Procedure_Group_Final": procedure.1,
        "Provider_Group": provider.0,
        "Provider_Group_Final": provider.1,
        "Insurance_Group": insurance.0,
        "Insurance_Group_Final": insurance.1,
        "Charge_Amount": amounts.0,
        "Payment_Amount": amounts.1,
        "Units": amounts.2,
        "DOS_Period": periods.0,
        "Posting_Period": periods.1,
    })
}

/// Five claims over Procedure, Provider and Insurance mappings.
///
/// Procedure has 4 distinct pairs, Provider 3, Insurance 3.
pub fn claims_table() -> FakeTable {
    FakeTable::new(&[
        "Charge_Amount",
        "Payment_Amount",
        "Units",
        "DOS_Period",
        "Posting_Period",
        "Procedure_Group",
        "Procedure_Group_Final",
        "Provider_Group",
        "Provider_Group_Final",
        "Insurance_Group",
        "Insurance_Group_Final",
    ])
    .row(claim(
        ("Office Visit", "E&M"),
        ("Smith", "Primary Care"),
        ("BCBS", "Commercial"),
        (100.0, 80.0, 1.0),
        ("2024-01", "2024-02"),
    ))
    .row(claim(
        ("Consult", "E&M"),
        ("Jones", "Primary Care"),
        ("Medicare A", "Medicare"),
        (200.0, 150.0, 2.0),
        ("2024-01", "2024-03"),
    ))
    .row(claim(
        ("Knee Surgery", "Surgery"),
        ("Lee", "Orthopedics"),
        ("BCBS", "Commercial"),
        (5000.0, 0.0, 1.0),
        ("2024-02", "2024-03"),
    ))
    .row(claim(
        ("Office Visit", "E&M"),
        ("Smith", "Primary Care"),
        ("Aetna", "Commercial"),
        (120.0, 100.0, 1.0),
        ("2024-03", "2024-04"),
    ))
    .row(claim(
        ("Hip Surgery", "Surgery"),
        ("Lee", "Orthopedics"),
        ("Medicare A", "Medicare"),
        (0.0, 300.0, 0.0),
        ("2024-03", "2024-04"),
    ))
}

/// A table with only Location columns and two claims.
pub fn locations_table() -> FakeTable {
    FakeTable::new(&[
        "Charge_Amount",
        "Payment_Amount",
        "Units",
        "DOS_Period",
        "Posting_Period",
        "Location_Group",
        "Location_Group_Final",
    ])
    .row(json!({
        "Location_Group": "Main St",
        "Location_Group_Final": "Downtown",
        "Charge_Amount": 10.0,
        "Payment_Amount": 5.0,
        "Units": 1.0,
        "DOS_Period": "2023-12",
        "Posting_Period": "2024-01",
    }))
    .row(json!({
        "Location_Group": "Oak Ave",
        "Location_Group_Final": "Suburbs",
        "Charge_Amount": 20.0,
        "Payment_Amount": 15.0,
        "Units": 2.0,
        "DOS_Period": "2023-12",
        "Posting_Period": "2024-02",
    }))
}

pub fn instance(table: &str) -> Instance {
    Instance::new(SERVER, DATABASE, table).with_credentials("sa", "secret")
}

pub fn fake_server() -> Arc<FakeSqlServer> {
    Arc::new(
        FakeSqlServer::new()
            .with_table("Claims", claims_table())
            .with_table("Locations", locations_table()),
    )
}

/// Persistence that fails saves for selected tabs and can fail every
/// project write.
#[derive(Default)]
pub struct FlakyPersistence {
    pub inner: MemoryPersistence,
    failing_tabs: StdMutex<HashSet<String>>,
    fail_projects: StdMutex<bool>,
    save_delay: StdMutex<Option<Duration>>,
}

impl FlakyPersistence {
    pub fn fail_tab(&self, tab_name: &str) {
        self.failing_tabs.lock().unwrap().insert(tab_name.to_string());
    }

    pub fn fail_project_writes(&self, fail: bool) {
        *self.fail_projects.lock().unwrap() = fail;
    }

    /// Holds every mapping save for `delay` before it reaches the store.
    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = Some(delay);
    }

    fn projects_failing(&self) -> bool {
        *self.fail_projects.lock().unwrap()
    }
}

impl PersistenceGateway for FlakyPersistence {
    fn list_projects<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Project>, PersistError>> {
        self.inner.list_projects(user_id)
    }

    fn create_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        if self.projects_failing() {
            return Box::pin(async { Err(PersistError::Server("500: unavailable".into())) });
        }
        self.inner.create_project(user_id, project)
    }

    fn update_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        if self.projects_failing() {
            return Box::pin(async { Err(PersistError::Server("500: unavailable".into())) });
        }
        self.inner.update_project(user_id, project)
    }

    fn delete_project<'a>(
        &'a self,
        user_id: &'a str,
        project_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        if self.projects_failing() {
            return Box::pin(async { Err(PersistError::Server("500: unavailable".into())) });
        }
        self.inner.delete_project(user_id, project_id)
    }

    fn save_mapping<'a>(
        &'a self,
        user_id: &'a str,
        instance: &'a InstanceKey,
        mapping: &'a Mapping,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        if self.failing_tabs.lock().unwrap().contains(&mapping.tab_name) {
            let tab = mapping.tab_name.clone();
            return Box::pin(async move { Err(PersistError::Conflict(format!("tab {tab} is stale"))) });
        }
        let delay = *self.save_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.save_mapping(user_id, instance, mapping).await
        })
    }
}

pub fn workspace_with(
    server: Arc<FakeSqlServer>,
    persistence: Arc<FlakyPersistence>,
    cache: CacheHandle,
) -> Workspace {
    Workspace::new(server, persistence, cache)
}

pub fn workspace(server: Arc<FakeSqlServer>) -> (Workspace, Arc<FlakyPersistence>) {
    let persistence = Arc::new(FlakyPersistence::default());
    let workspace = workspace_with(server, persistence.clone(), CacheHandle::in_memory());
    (workspace, persistence)
}

pub struct BufferWriter(Arc<StdMutex<Vec<u8>>>);

impl std::io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn init_buffer_subscriber() -> (Arc<StdMutex<Vec<u8>>>, DefaultGuard) {
    let buffer: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
    let writer = buffer.clone();
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new("waterfall=debug"))
        .with_writer(move || BufferWriter(writer.clone()))
        .json()
        .finish();
    let guard = subscriber::set_default(subscriber);
    (buffer, guard)
}

/// `event` fields of every captured log line, in order.
pub fn logged_events(buffer: &Arc<StdMutex<Vec<u8>>>) -> Vec<String> {
    let raw = String::from_utf8(buffer.lock().unwrap().clone()).expect("log utf8");
    raw.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|value| {
            value
                .get("fields")
                .and_then(|fields| fields.get("event"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}
