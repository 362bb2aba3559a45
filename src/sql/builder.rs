//! Statement text for introspection and aggregation (T-SQL dialect).

use super::ident::{like_contains, quote_ident, quoted, TableRef};
use super::{QueryError, QueryKind, SqlQuery};
use crate::model::{Keyword, NumericField};

pub const DOS_PERIOD: &str = "DOS_Period";
pub const POSTING_PERIOD: &str = "Posting_Period";
pub const CHARGE_AMOUNT: &str = "Charge_Amount";
pub const PAYMENT_AMOUNT: &str = "Payment_Amount";
pub const UNITS: &str = "Units";

pub const TOTAL_CHARGE_AMOUNT: &str = "Total_Charge_Amount";
pub const TOTAL_PAYMENT_AMOUNT: &str = "Total_Payment_Amount";
pub const EARLIEST_MIN_DOS: &str = "Earliest_Min_DOS";
pub const LATEST_MAX_DOS: &str = "Latest_Max_DOS";

/// Physical columns backing a keyword's group and final group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupColumns {
    pub group: String,
    pub group_final: String,
}

/// Column names on `table` containing `pattern`, ordered by name.
pub fn column_lookup(table: &TableRef, pattern: &str) -> SqlQuery {
    let mut text = String::from(
        "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_NAME = @table AND COLUMN_NAME LIKE @pattern",
    );
    if table.schema.is_some() {
        text.push_str(" AND TABLE_SCHEMA = @schema");
    }
    text.push_str(" ORDER BY COLUMN_NAME");

    let mut query = SqlQuery::new(QueryKind::ColumnLookup(pattern.to_string()), text)
        .bind("table", table.name.as_str())
        .bind("pattern", like_contains(pattern));
    if let Some(schema) = &table.schema {
        query = query.bind("schema", schema.as_str());
    }
    query
}

fn numeric_expr(field: NumericField) -> String {
    let charge = quote_ident(CHARGE_AMOUNT);
    let payment = quote_ident(PAYMENT_AMOUNT);
    match field {
        NumericField::ChargeAmount => format!("SUM({charge})"),
        NumericField::PaymentAmount => format!("SUM({payment})"),
        NumericField::Unit => format!("SUM({})", quote_ident(UNITS)),
        NumericField::ChargeCount => {
            format!("SUM(CASE WHEN {charge} <> 0 THEN 1 ELSE 0 END)")
        }
        NumericField::PaymentCount => {
            format!("SUM(CASE WHEN {payment} <> 0 THEN 1 ELSE 0 END)")
        }
        NumericField::RowCount => "COUNT(*)".to_string(),
        NumericField::PeriodCount => format!("COUNT(DISTINCT {})", quote_ident(DOS_PERIOD)),
    }
}

/// Single-row query producing every [`NumericField`] under its alias.
pub fn numeric_totals(table: &TableRef) -> SqlQuery {
    let select = NumericField::ALL
        .iter()
        .map(|field| format!("{} AS {}", numeric_expr(*field), quote_ident(field.alias())))
        .collect::<Vec<_>>()
        .join(", ");
    SqlQuery::new(
        QueryKind::NumericTotals,
        format!("SELECT {select} FROM {}", table.quoted()),
    )
}

/// Number of distinct `(Group_Final, Group)` pairs, returned as `count`.
pub fn group_count(
    table: &TableRef,
    keyword: Keyword,
    columns: &GroupColumns,
) -> Result<SqlQuery, QueryError> {
    let group_final = quoted(&columns.group_final)?;
    let group = quoted(&columns.group)?;
    Ok(SqlQuery::new(
        QueryKind::GroupCount(keyword),
        format!(
            "SELECT COUNT(*) AS [count] FROM (\
             SELECT DISTINCT {group_final}, {group} FROM {}\
             ) AS pairs",
            table.quoted()
        ),
    ))
}

/// Per-group totals and date span for one keyword.
pub fn mapping_rows(
    table: &TableRef,
    keyword: Keyword,
    columns: &GroupColumns,
) -> Result<SqlQuery, QueryError> {
    let group_final = quoted(&columns.group_final)?;
    let group = quoted(&columns.group)?;
    let dos = quote_ident(DOS_PERIOD);
    let text = format!(
        "SELECT {group_final} AS {final_alias}, {group} AS {group_alias}, \
         SUM({charge}) AS {total_charge}, \
         SUM({payment}) AS {total_payment}, \
         MIN({dos}) AS {earliest}, \
         MAX({dos}) AS {latest} \
         FROM {table} \
         GROUP BY {group_final}, {group} \
         ORDER BY {group_final}, {group}",
        final_alias = quote_ident(&keyword.group_final_field()),
        group_alias = quote_ident(&keyword.group_field()),
        charge = quote_ident(CHARGE_AMOUNT),
        payment = quote_ident(PAYMENT_AMOUNT),
        total_charge = quote_ident(TOTAL_CHARGE_AMOUNT),
        total_payment = quote_ident(TOTAL_PAYMENT_AMOUNT),
        earliest = quote_ident(EARLIEST_MIN_DOS),
        latest = quote_ident(LATEST_MAX_DOS),
        table = table.quoted(),
    );
    Ok(SqlQuery::new(QueryKind::MappingRows(keyword), text))
}

/// Distinct non-null values of a fixed column, returned as `value`.
pub fn distinct_values(table: &TableRef, column: &'static str) -> SqlQuery {
    let col = quote_ident(column);
    SqlQuery::new(
        QueryKind::DistinctValues(column),
        format!(
            "SELECT DISTINCT {col} AS [value] FROM {} WHERE {col} IS NOT NULL ORDER BY [value]",
            table.quoted()
        ),
    )
}
