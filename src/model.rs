//! Plain data shared by the engines and handed to the UI.
//!
//! Everything here is JSON-compatible; field names follow the camelCase shape
//! the front-end binds to.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

pub const WATERFALL_GROUP: &str = "Waterfall_Group";
pub const DOS_COLUMN_LABEL: &str = "DOS";
pub const POSTING_COLUMN_LABEL: &str = "Posting";

/// Connection descriptor handed to the SQL endpoint. Opaque to the core.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for SqlCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single table under analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub is_remote: bool,
    pub server: String,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub sql_credentials: SqlCredentials,
}

impl Instance {
    pub fn new(
        server: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            is_remote: false,
            server: server.into(),
            database: database.into(),
            table: table.into(),
            sql_credentials: SqlCredentials::default(),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.sql_credentials = SqlCredentials {
            user: user.into(),
            password: password.into(),
        };
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            server: self.server.clone(),
            database: self.database.clone(),
            table: self.table.clone(),
        }
    }
}

/// The `(server, database, table)` identity every cache key and derived
/// structure is namespaced by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub server: String,
    pub database: String,
    pub table: String,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server, self.database, self.table)
    }
}

/// Categorical mapping families recognised by column-name pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum Keyword {
    Procedure,
    Provider,
    Insurance,
    Location,
}

impl Keyword {
    /// Candidates in discovery order.
    pub const ALL: [Keyword; 4] = [
        Keyword::Procedure,
        Keyword::Provider,
        Keyword::Insurance,
        Keyword::Location,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Procedure => "Procedure",
            Keyword::Provider => "Provider",
            Keyword::Insurance => "Insurance",
            Keyword::Location => "Location",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kw| kw.as_str() == raw)
    }

    /// Output alias of the raw group column, e.g. `Procedure_Group`.
    pub fn group_field(self) -> String {
        format!("{}_Group", self.as_str())
    }

    /// Output alias of the reconciled group column, e.g. `Procedure_Group_Final`.
    pub fn group_final_field(self) -> String {
        format!("{}_Group_Final", self.as_str())
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum NumericKind {
    Amount,
    Count,
}

/// The fixed set of numeric aggregates shown for every table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericField {
    ChargeAmount,
    PaymentAmount,
    Unit,
    ChargeCount,
    PaymentCount,
    RowCount,
    PeriodCount,
}

impl NumericField {
    pub const ALL: [NumericField; 7] = [
        NumericField::ChargeAmount,
        NumericField::PaymentAmount,
        NumericField::Unit,
        NumericField::ChargeCount,
        NumericField::PaymentCount,
        NumericField::RowCount,
        NumericField::PeriodCount,
    ];

    pub fn label(self) -> &'static str {
        match self {
            NumericField::ChargeAmount => "Charge Amount",
            NumericField::PaymentAmount => "Payment Amount",
            NumericField::Unit => "Unit",
            NumericField::ChargeCount => "Charge Count",
            NumericField::PaymentCount => "Payment Count",
            NumericField::RowCount => "Row Count",
            NumericField::PeriodCount => "Period Count",
        }
    }

    /// Column alias used in the totals query result.
    pub fn alias(self) -> &'static str {
        match self {
            NumericField::ChargeAmount => "total_charge_amount",
            NumericField::PaymentAmount => "total_payment_amount",
            NumericField::Unit => "total_units",
            NumericField::ChargeCount => "charge_count",
            NumericField::PaymentCount => "payment_count",
            NumericField::RowCount => "row_count",
            NumericField::PeriodCount => "period_count",
        }
    }

    pub fn kind(self) -> NumericKind {
        match self {
            NumericField::ChargeAmount | NumericField::PaymentAmount => NumericKind::Amount,
            _ => NumericKind::Count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct NumericRow {
    pub field_name: String,
    #[serde(rename = "type")]
    pub kind: NumericKind,
    pub include: bool,
    pub divide_by: f64,
    pub schedule: bool,
    pub total: f64,
}

impl NumericRow {
    pub fn new(field: NumericField, total: f64) -> Self {
        Self {
            field_name: field.label().to_string(),
            kind: field.kind(),
            include: true,
            divide_by: 1.0,
            schedule: false,
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CohortRow {
    pub waterfall_cohort_name: String,
    pub run: bool,
    pub aggregate: bool,
    pub count: u64,
}

impl CohortRow {
    pub fn new(keyword: Keyword, count: u64) -> Self {
        Self {
            waterfall_cohort_name: keyword.as_str().to_string(),
            run: true,
            aggregate: true,
            count,
        }
    }
}

/// One column of the cohort reference pivot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PivotColumn {
    pub label: String,
    pub values: Vec<String>,
}

/// Read/write snapshot bound to the UI for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub numeric_table_data: Vec<NumericRow>,
    pub waterfall_cohorts_table_data: Vec<CohortRow>,
    pub waterfall_cohort_list_data: Vec<PivotColumn>,
}

impl InstanceView {
    /// Keywords present in the cohort table, in table order.
    pub fn keywords(&self) -> Vec<Keyword> {
        self.waterfall_cohorts_table_data
            .iter()
            .filter_map(|row| Keyword::parse(&row.waterfall_cohort_name))
            .collect()
    }

    pub fn column(&self, label: &str) -> Option<&PivotColumn> {
        self.waterfall_cohort_list_data
            .iter()
            .find(|column| column.label == label)
    }

    /// Row-major rendering of the cohort pivot. Shorter columns are padded
    /// with empty cells.
    pub fn pivot_rows(&self) -> Vec<Vec<String>> {
        let height = self
            .waterfall_cohort_list_data
            .iter()
            .map(|column| column.values.len())
            .max()
            .unwrap_or(0);
        (0..height)
            .map(|idx| {
                self.waterfall_cohort_list_data
                    .iter()
                    .map(|column| column.values.get(idx).cloned().unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

/// One aggregated group of a mapping tab, keyed by output column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingRow(pub Map<String, Value>);

impl MappingRow {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn text(&self, field: &str) -> Option<String> {
        self.0.get(field).and_then(value_to_text)
    }

    pub fn waterfall_group(&self) -> Option<&str> {
        self.0.get(WATERFALL_GROUP).and_then(Value::as_str)
    }

    pub fn set_waterfall_group(&mut self, value: impl Into<String>) {
        self.0
            .insert(WATERFALL_GROUP.to_string(), Value::String(value.into()));
    }

    /// Copies `<keyword>_Group_Final` into `Waterfall_Group`.
    pub fn sync_waterfall_group(&mut self, keyword: Keyword) {
        let synced = self
            .0
            .get(&keyword.group_final_field())
            .cloned()
            .unwrap_or(Value::Null);
        self.0.insert(WATERFALL_GROUP.to_string(), synced);
    }
}

/// Editable reconciliation table for one keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub tab_name: String,
    pub keyword: Keyword,
    pub data: Vec<Arc<MappingRow>>,
}

impl Mapping {
    /// Builds a tab whose `Waterfall_Group` already mirrors the final group.
    pub fn synced(keyword: Keyword, rows: Vec<MappingRow>) -> Self {
        let data = rows
            .into_iter()
            .map(|mut row| {
                row.sync_waterfall_group(keyword);
                Arc::new(row)
            })
            .collect();
        Self {
            tab_name: keyword.as_str().to_string(),
            keyword,
            data,
        }
    }

    /// Distinct non-empty `Waterfall_Group` values in first-seen order.
    pub fn distinct_waterfall_groups(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.data
            .iter()
            .filter_map(|row| row.waterfall_group())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .filter(|value| seen.insert(value.to_string()))
            .map(str::to_string)
            .collect()
    }
}

/// Renders a scalar SQL value as pivot text. Nulls and empty strings yield `None`.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
