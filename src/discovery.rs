use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::{CacheHandle, CacheKey};
use crate::executor::QueryExecutor;
use crate::model::{Instance, Keyword, MappingRow};
use crate::sql::builder::{self, GroupColumns};
use crate::sql::{value_as_f64, QueryError, SqlConfig, TableRef};
use crate::{AppError, AppResult};

/// Whether a fetch may be answered from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPolicy {
    UseCache,
    /// Skip the cache read; the fresh result still overwrites the entry.
    Refresh,
}

/// Finds mapping keywords on a table and computes their aggregates.
#[derive(Clone)]
pub struct MappingDiscovery {
    executor: QueryExecutor,
    cache: CacheHandle,
}

impl MappingDiscovery {
    pub fn new(executor: QueryExecutor, cache: CacheHandle) -> Self {
        Self { executor, cache }
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Keywords with at least one column containing the keyword, in
    /// [`Keyword::ALL`] order. Always read from the live schema.
    ///
    /// A failed lookup drops only its keyword. When every lookup fails the
    /// first error is returned so the caller can report it.
    pub async fn discover_keywords(&self, instance: &Instance) -> AppResult<Vec<Keyword>> {
        let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
        let config = SqlConfig::for_instance(instance);

        let lookups = Keyword::ALL.iter().map(|keyword| {
            let table = &table;
            let config = &config;
            async move {
                let result = self
                    .executor
                    .find_columns_matching(config, table, keyword.as_str())
                    .await;
                (*keyword, result)
            }
        });
        let results = join_all(lookups).await;

        let mut keywords = Vec::new();
        let mut first_error: Option<QueryError> = None;
        let mut failures = 0usize;
        for (keyword, result) in results {
            match result {
                Ok(columns) if !columns.is_empty() => keywords.push(keyword),
                Ok(_) => {}
                Err(err) => {
                    failures += 1;
                    warn!(
                        target: "waterfall",
                        event = "keyword_lookup_failed",
                        keyword = keyword.as_str(),
                        instance = %instance.key(),
                        error = %err
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        if failures == Keyword::ALL.len() {
            if let Some(err) = first_error {
                return Err(AppError::from(err).with_context("instance", instance.key().to_string()));
            }
        }
        info!(
            target: "waterfall",
            event = "keywords_discovered",
            instance = %instance.key(),
            keywords = ?keywords
        );
        Ok(keywords)
    }

    /// Resolves the physical `<kw>_Group` and `<kw>_Group_Final` columns.
    ///
    /// When several columns qualify for a role the lexicographically first
    /// name wins. A group column is any match that is not a final column.
    pub async fn resolve_group_columns(
        &self,
        instance: &Instance,
        keyword: Keyword,
    ) -> AppResult<GroupColumns> {
        let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
        let config = SqlConfig::for_instance(instance);
        let group_pattern = keyword.group_field();
        let final_pattern = keyword.group_final_field();

        let matches = self
            .executor
            .find_columns_matching(&config, &table, &group_pattern)
            .await
            .map_err(|err| AppError::from(err).with_context("keyword", keyword.as_str()))?;

        let group_final = matches.iter().find(|name| name.contains(&final_pattern));
        let group = matches
            .iter()
            .find(|name| !name.contains("_Group_Final"));

        match (group, group_final) {
            (Some(group), Some(group_final)) => Ok(GroupColumns {
                group: group.clone(),
                group_final: group_final.clone(),
            }),
            _ => Err(AppError::new(
                AppError::SCHEMA_MISMATCH,
                format!("Table has no {group_pattern}/{final_pattern} column pair"),
            )
            .with_context("keyword", keyword.as_str())
            .with_context("instance", instance.key().to_string())),
        }
    }

    /// Distinct `(Group_Final, Group)` pair count, memoized per keyword.
    pub async fn count_groups(
        &self,
        instance: &Instance,
        keyword: Keyword,
        policy: FetchPolicy,
    ) -> AppResult<u64> {
        let key = CacheKey::for_instance(&instance.key(), Some(keyword), "count");
        if policy == FetchPolicy::UseCache {
            if let Some(count) = self.cache.get::<u64>(&key).await {
                return Ok(count);
            }
        }

        let columns = self.resolve_group_columns(instance, keyword).await?;
        let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
        let query = builder::group_count(&table, keyword, &columns).map_err(AppError::from)?;
        let rows = self
            .executor
            .execute(&SqlConfig::for_instance(instance), &query)
            .await
            .map_err(|err| AppError::from(err).with_context("keyword", keyword.as_str()))?;

        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(value_as_f64)
            .map(|value| value.max(0.0) as u64)
            .ok_or_else(|| {
                AppError::from(QueryError::Decode("group count row missing".into()))
                    .with_context("keyword", keyword.as_str())
            })?;
        self.cache.put(&key, &count).await;
        Ok(count)
    }

    /// Aggregated rows for one keyword with `Waterfall_Group` synced to the
    /// final group. Memoized by the normalized statement text.
    pub async fn fetch_mapping_rows(
        &self,
        instance: &Instance,
        keyword: Keyword,
        policy: FetchPolicy,
    ) -> AppResult<Vec<MappingRow>> {
        let columns = self.resolve_group_columns(instance, keyword).await?;
        let table = TableRef::parse(&instance.table).map_err(AppError::from)?;
        let query = builder::mapping_rows(&table, keyword, &columns).map_err(AppError::from)?;
        let key = CacheKey::for_query(&instance.key(), Some(keyword), &query.text);

        if policy == FetchPolicy::UseCache {
            if let Some(rows) = self.cache.get::<Vec<MappingRow>>(&key).await {
                return Ok(rows);
            }
        }

        let rows = self
            .executor
            .execute(&SqlConfig::for_instance(instance), &query)
            .await
            .map_err(|err| AppError::from(err).with_context("keyword", keyword.as_str()))?;
        let rows: Vec<MappingRow> = rows
            .into_iter()
            .map(|row| {
                let mut row = MappingRow(row);
                row.sync_waterfall_group(keyword);
                row
            })
            .collect();
        self.cache.put(&key, &rows).await;
        Ok(rows)
    }
}
