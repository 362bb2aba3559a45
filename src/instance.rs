//! View-model of the selected table.
//!
//! `set_instance` fans out over discovery, numeric totals, per-keyword group
//! counts and the period pivots, then commits one snapshot. A failed branch
//! degrades to empty or zero and is recorded in the load status; only a newer
//! `set_instance` can stop the commit.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::CacheKey;
use crate::discovery::{FetchPolicy, MappingDiscovery};
use crate::model::{
    value_to_text, CohortRow, Instance, InstanceView, Keyword, NumericField, NumericRow,
    PivotColumn, DOS_COLUMN_LABEL, POSTING_COLUMN_LABEL,
};
use crate::sql::builder::{self, DOS_PERIOD, POSTING_PERIOD};
use crate::sql::{value_as_f64, Row, SqlConfig, TableRef};
use crate::state::{LoadStatus, MappingsState, Snapshot, StateStore};
use crate::{AppError, AppResult};

pub const INSTANCE_UNSET: &str = "INSTANCE/UNSET";
pub const UNKNOWN_COHORT: &str = "INSTANCE/UNKNOWN_COHORT";
pub const UNKNOWN_FIELD: &str = "INSTANCE/UNKNOWN_FIELD";
pub const INVALID_DIVISOR: &str = "INSTANCE/INVALID_DIVISOR";
pub const INSTANCE_CHANGED: &str = "INSTANCE/CHANGED";

#[derive(Debug, Clone)]
pub enum InstanceOutcome {
    Committed(Arc<Snapshot>),
    /// A newer `set_instance` started while this one was in flight.
    Superseded,
}

impl InstanceOutcome {
    pub fn committed(&self) -> Option<&Arc<Snapshot>> {
        match self {
            InstanceOutcome::Committed(snapshot) => Some(snapshot),
            InstanceOutcome::Superseded => None,
        }
    }
}

#[derive(Clone)]
pub struct InstanceEngine {
    discovery: MappingDiscovery,
    state: Arc<StateStore>,
}

impl InstanceEngine {
    pub fn new(discovery: MappingDiscovery, state: Arc<StateStore>) -> Self {
        Self { discovery, state }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub async fn set_instance(&self, instance: Instance) -> InstanceOutcome {
        let key = instance.key();
        let (generation, prior) = self.state.begin_instance(instance.clone());
        info!(target: "waterfall", event = "instance_loading", instance = %key, generation);

        let mut errors: Vec<AppError> = Vec::new();
        let keywords = match self.discovery.discover_keywords(&instance).await {
            Ok(keywords) => keywords,
            Err(err) => {
                errors.push(err);
                Vec::new()
            }
        };

        let (numeric, cohorts, dos, posting) = futures::join!(
            self.numeric_rows(&instance),
            self.cohort_rows(&instance, &keywords),
            self.distinct_period(&instance, DOS_PERIOD),
            self.distinct_period(&instance, POSTING_PERIOD),
        );

        let numeric_table_data = numeric.unwrap_or_else(|err| {
            errors.push(err);
            Vec::new()
        });
        let (waterfall_cohorts_table_data, count_errors) = cohorts;
        errors.extend(count_errors);
        let dos = dos.unwrap_or_else(|err| {
            errors.push(err);
            Vec::new()
        });
        let posting = posting.unwrap_or_else(|err| {
            errors.push(err);
            Vec::new()
        });

        let mut waterfall_cohort_list_data = vec![
            PivotColumn {
                label: DOS_COLUMN_LABEL.to_string(),
                values: dos,
            },
            PivotColumn {
                label: POSTING_COLUMN_LABEL.to_string(),
                values: posting,
            },
        ];
        for row in &waterfall_cohorts_table_data {
            let values = prior
                .as_ref()
                .and_then(|mappings| mappings.tab(&row.waterfall_cohort_name))
                .map(|tab| tab.distinct_waterfall_groups())
                .unwrap_or_default();
            waterfall_cohort_list_data.push(PivotColumn {
                label: row.waterfall_cohort_name.clone(),
                values,
            });
        }

        let view = InstanceView {
            numeric_table_data,
            waterfall_cohorts_table_data,
            waterfall_cohort_list_data,
        };
        let error_count = errors.len();
        let status = if errors.is_empty() {
            LoadStatus::Ready
        } else {
            LoadStatus::ReadyWithErrors(errors)
        };

        let committed = self.state.update(generation, |snap| {
            snap.status = status;
            snap.view = Arc::new(view);
            snap.mappings = Arc::new(MappingsState::empty_for(Some(key.clone())));
        });
        if !committed {
            info!(
                target: "waterfall",
                event = "instance_result_discarded",
                instance = %key,
                generation
            );
            return InstanceOutcome::Superseded;
        }
        info!(
            target: "waterfall",
            event = "instance_committed",
            instance = %key,
            generation,
            keywords = keywords.len(),
            errors = error_count
        );
        InstanceOutcome::Committed(self.state.snapshot())
    }

    async fn numeric_rows(&self, instance: &Instance) -> AppResult<Vec<NumericRow>> {
        let cache = self.discovery.cache();
        let key = CacheKey::for_instance(&instance.key(), None, "numeric");
        let totals: Row = match cache.get::<Row>(&key).await {
            Some(totals) => totals,
            None => {
                let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
                let rows = self
                    .discovery
                    .executor()
                    .execute(&SqlConfig::for_instance(instance), &builder::numeric_totals(&table))
                    .await
                    .map_err(|err| AppError::from(err).with_context("aggregate", "numeric"))?;
                let totals = rows.into_iter().next().unwrap_or_default();
                cache.put(&key, &totals).await;
                totals
            }
        };
        Ok(NumericField::ALL
            .iter()
            .map(|field| {
                // SUM over an empty table is NULL.
                let total = totals
                    .get(field.alias())
                    .and_then(value_as_f64)
                    .unwrap_or(0.0);
                NumericRow::new(*field, total)
            })
            .collect())
    }

    /// One row per keyword whose group columns resolve. A failed count keeps
    /// its keyword with a zero count.
    async fn cohort_rows(
        &self,
        instance: &Instance,
        keywords: &[Keyword],
    ) -> (Vec<CohortRow>, Vec<AppError>) {
        let counts = join_all(keywords.iter().map(|keyword| async move {
            let count = self
                .discovery
                .count_groups(instance, *keyword, FetchPolicy::UseCache)
                .await;
            (*keyword, count)
        }))
        .await;

        let mut rows = Vec::with_capacity(counts.len());
        let mut errors = Vec::new();
        for (keyword, count) in counts {
            match count {
                Ok(count) => rows.push(CohortRow::new(keyword, count)),
                Err(err) if err.code() == AppError::SCHEMA_MISMATCH => {
                    info!(
                        target: "waterfall",
                        event = "keyword_skipped",
                        keyword = keyword.as_str(),
                        reason = %err
                    );
                }
                Err(err) => {
                    warn!(
                        target: "waterfall",
                        event = "group_count_failed",
                        keyword = keyword.as_str(),
                        error = %err
                    );
                    rows.push(CohortRow::new(keyword, 0));
                    errors.push(err);
                }
            }
        }
        (rows, errors)
    }

    async fn distinct_period(
        &self,
        instance: &Instance,
        column: &'static str,
    ) -> AppResult<Vec<String>> {
        let cache = self.discovery.cache();
        let key = CacheKey::for_instance(&instance.key(), None, &format!("distinct:{column}"));
        if let Some(values) = cache.get::<Vec<String>>(&key).await {
            return Ok(values);
        }
        let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
        let rows = self
            .discovery
            .executor()
            .execute(
                &SqlConfig::for_instance(instance),
                &builder::distinct_values(&table, column),
            )
            .await
            .map_err(|err| {
                let err = AppError::from(err).with_context("column", column);
                warn!(target: "waterfall", event = "distinct_values_failed", column, error = %err);
                err
            })?;

        let mut values: Vec<String> = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(text) = row.get("value").and_then(value_to_text) {
                if !values.contains(&text) {
                    values.push(text);
                }
            }
        }
        cache.put(&key, &values).await;
        Ok(values)
    }

    /// Rebuilds the keyword pivot columns from the in-memory mapping tabs.
    /// Keywords without a loaded tab keep their current column.
    pub fn upsync_current_mappings(&self) -> AppResult<Arc<InstanceView>> {
        self.state.try_update_current(fold_mappings)
    }

    /// Same as [`InstanceEngine::upsync_current_mappings`], but only while the
    /// snapshot is still at `generation`.
    pub fn upsync_mappings_at(&self, generation: u64) -> AppResult<Arc<InstanceView>> {
        self.state.try_update_current(|snap| {
            if snap.generation != generation {
                return Err(AppError::new(
                    INSTANCE_CHANGED,
                    "The selected table changed; the cohort list was not updated.",
                )
                .with_context("expected_generation", generation.to_string())
                .with_context("current_generation", snap.generation.to_string()));
            }
            fold_mappings(snap)
        })
    }

    pub fn set_cohort_flags(&self, cohort_name: &str, run: bool, aggregate: bool) -> AppResult<()> {
        self.state.try_update_current(|snap| {
            let view = Arc::make_mut(&mut snap.view);
            let row = view
                .waterfall_cohorts_table_data
                .iter_mut()
                .find(|row| row.waterfall_cohort_name == cohort_name)
                .ok_or_else(|| {
                    AppError::new(UNKNOWN_COHORT, "No such cohort on this table.")
                        .with_context("cohort", cohort_name)
                })?;
            row.run = run;
            row.aggregate = aggregate;
            Ok(())
        })
    }

    pub fn update_numeric_row(
        &self,
        field_name: &str,
        include: bool,
        divide_by: f64,
        schedule: bool,
    ) -> AppResult<()> {
        if !divide_by.is_finite() || divide_by <= 0.0 {
            return Err(
                AppError::new(INVALID_DIVISOR, "Divide-by must be a positive number.")
                    .with_context("divide_by", divide_by.to_string()),
            );
        }
        self.state.try_update_current(|snap| {
            let view = Arc::make_mut(&mut snap.view);
            let row = view
                .numeric_table_data
                .iter_mut()
                .find(|row| row.field_name == field_name)
                .ok_or_else(|| {
                    AppError::new(UNKNOWN_FIELD, "No such numeric field.")
                        .with_context("field", field_name)
                })?;
            row.include = include;
            row.divide_by = divide_by;
            row.schedule = schedule;
            Ok(())
        })
    }
}

fn fold_mappings(snap: &mut Snapshot) -> AppResult<Arc<InstanceView>> {
    let key = snap
        .instance_key()
        .ok_or_else(|| AppError::new(INSTANCE_UNSET, "No table is selected."))?;
    if !snap.mappings.is_loaded_for(&key) {
        return Ok(snap.view.clone());
    }
    let mappings = snap.mappings.clone();
    let view = Arc::make_mut(&mut snap.view);
    for column in view.waterfall_cohort_list_data.iter_mut() {
        if let Some(tab) = mappings.tab(&column.label) {
            column.values = tab.distinct_waterfall_groups();
        }
    }
    info!(target: "waterfall", event = "cohort_list_upsynced", instance = %key);
    Ok(snap.view.clone())
}
