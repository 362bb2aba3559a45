use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::discovery::{FetchPolicy, MappingDiscovery};
use crate::instance::{InstanceEngine, INSTANCE_UNSET};
use crate::model::{Instance, InstanceKey, InstanceView, Mapping};
use crate::persistence::PersistenceGateway;
use crate::state::{Commit, MappingsState, RefreshGuard, Snapshot, StateStore};
use crate::{AppError, AppResult};

pub const INSTANCE_MISMATCH: &str = "MAPPINGS/INSTANCE_MISMATCH";
pub const NOT_LOADED: &str = "MAPPINGS/NOT_LOADED";
pub const INDEX_OUT_OF_RANGE: &str = "MAPPINGS/INDEX_OUT_OF_RANGE";

#[derive(Debug, Clone)]
pub enum MappingsOutcome {
    Loaded {
        snapshot: Arc<Snapshot>,
        /// Tabs that could not be fetched. They are kept with no rows.
        errors: Vec<AppError>,
    },
    AlreadyLoaded(Arc<Snapshot>),
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabFailure {
    pub tab_name: String,
    pub error: AppError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsyncReport {
    pub persisted: Vec<String>,
    pub failed: Vec<TabFailure>,
    pub view: Arc<InstanceView>,
}

#[derive(Clone)]
pub struct MappingsEngine {
    discovery: MappingDiscovery,
    instance: InstanceEngine,
    persistence: Arc<dyn PersistenceGateway>,
}

impl MappingsEngine {
    pub fn new(
        discovery: MappingDiscovery,
        instance: InstanceEngine,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            discovery,
            instance,
            persistence,
        }
    }

    fn state(&self) -> &Arc<StateStore> {
        self.instance.state()
    }

    /// Loads one tab per cohort keyword. Does nothing when tabs for this
    /// instance are already present, so edits survive re-opening.
    pub async fn set_mappings_state(&self, instance: &Instance) -> AppResult<MappingsOutcome> {
        let snapshot = self.current_for(instance)?;
        let key = instance.key();
        if snapshot.mappings.is_loaded_for(&key) {
            return Ok(MappingsOutcome::AlreadyLoaded(snapshot));
        }
        self.load(instance, &snapshot, FetchPolicy::UseCache).await
    }

    /// Re-fetches every tab, bypassing cached rows, and replaces the current
    /// tabs including any unsynced edits.
    pub async fn refresh_mappings_state(&self, instance: &Instance) -> AppResult<MappingsOutcome> {
        let _guard: RefreshGuard = self.state().begin_refresh()?;
        let snapshot = self.current_for(instance)?;
        info!(target: "waterfall", event = "mappings_refresh_started", instance = %instance.key());
        self.load(instance, &snapshot, FetchPolicy::Refresh).await
    }

    fn current_for(&self, instance: &Instance) -> AppResult<Arc<Snapshot>> {
        let snapshot = self.state().snapshot();
        match snapshot.instance_key() {
            Some(current) if current == instance.key() => Ok(snapshot),
            Some(current) => Err(AppError::new(
                INSTANCE_MISMATCH,
                "Mappings requested for a table that is not selected.",
            )
            .with_context("selected", current.to_string())
            .with_context("requested", instance.key().to_string())),
            None => Err(AppError::new(INSTANCE_UNSET, "No table is selected.")),
        }
    }

    async fn load(
        &self,
        instance: &Instance,
        snapshot: &Snapshot,
        policy: FetchPolicy,
    ) -> AppResult<MappingsOutcome> {
        let key = instance.key();
        let generation = snapshot.generation;
        let keywords = snapshot.view.keywords();

        let fetched = join_all(keywords.iter().map(|keyword| async move {
            let rows = self
                .discovery
                .fetch_mapping_rows(instance, *keyword, policy)
                .await;
            (*keyword, rows)
        }))
        .await;

        let mut tabs: Vec<Arc<Mapping>> = Vec::with_capacity(fetched.len());
        let mut errors = Vec::new();
        for (keyword, rows) in fetched {
            match rows {
                Ok(rows) => tabs.push(Arc::new(Mapping::synced(keyword, rows))),
                Err(err) => {
                    warn!(
                        target: "waterfall",
                        event = "mapping_fetch_failed",
                        keyword = keyword.as_str(),
                        instance = %key,
                        error = %err
                    );
                    tabs.push(Arc::new(Mapping::synced(keyword, Vec::new())));
                    errors.push(err);
                }
            }
        }
        tabs.sort_by(|a, b| a.tab_name.cmp(&b.tab_name));

        let tab_count = tabs.len();
        let commit = self.state().update_with(generation, |snap| {
            // A concurrent open may have committed, and been edited, while
            // this one was fetching.
            if policy == FetchPolicy::UseCache && snap.mappings.is_loaded_for(&key) {
                return false;
            }
            snap.mappings = Arc::new(MappingsState {
                instance: Some(key.clone()),
                loaded: true,
                tabs,
            });
            true
        });
        if commit == Commit::Declined {
            info!(target: "waterfall", event = "mappings_already_loaded", instance = %key);
            return Ok(MappingsOutcome::AlreadyLoaded(self.state().snapshot()));
        }
        if commit == Commit::Stale {
            info!(
                target: "waterfall",
                event = "mappings_result_discarded",
                instance = %key,
                generation
            );
            return Ok(MappingsOutcome::Superseded);
        }
        info!(
            target: "waterfall",
            event = "mappings_committed",
            instance = %key,
            tabs = tab_count,
            errors = errors.len(),
            refresh = policy == FetchPolicy::Refresh
        );
        Ok(MappingsOutcome::Loaded {
            snapshot: self.state().snapshot(),
            errors,
        })
    }

    /// Sets `Waterfall_Group` of one row. Only the addressed row and the
    /// containing tab are copied; every other row stays shared.
    pub fn modify_waterfall_group(
        &self,
        mapping_index: usize,
        row_index: usize,
        value: impl Into<String>,
    ) -> AppResult<()> {
        let value = value.into();
        self.state().try_update_current(|snap| {
            if self.state().refresh_active() {
                return Err(AppError::new(
                    RefreshGuard::IN_PROGRESS,
                    "Mappings are being refreshed; try again when it finishes.",
                ));
            }
            let mappings = Arc::make_mut(&mut snap.mappings);
            if !mappings.loaded {
                return Err(AppError::new(NOT_LOADED, "Mappings have not been loaded."));
            }
            let tab = mappings
                .tabs
                .get_mut(mapping_index)
                .ok_or_else(|| out_of_range("mapping_index", mapping_index))?;
            let tab = Arc::make_mut(tab);
            let row = tab
                .data
                .get_mut(row_index)
                .ok_or_else(|| out_of_range("row_index", row_index))?;
            Arc::make_mut(row).set_waterfall_group(value);
            Ok(())
        })
    }

    /// Persists every tab, one write per tab, then folds the edited groups
    /// into the instance pivot. A failed tab keeps its in-memory edits.
    pub async fn upsync_mappings(&self, user_id: &str) -> AppResult<UpsyncReport> {
        let snapshot = self.state().snapshot();
        let key = snapshot
            .instance_key()
            .ok_or_else(|| AppError::new(INSTANCE_UNSET, "No table is selected."))?;
        if !snapshot.mappings.is_loaded_for(&key) {
            return Err(AppError::new(NOT_LOADED, "Mappings have not been loaded."));
        }

        let results = join_all(
            snapshot
                .mappings
                .tabs
                .iter()
                .map(|tab| self.save_tab(user_id, &key, tab)),
        )
        .await;

        let mut persisted = Vec::new();
        let mut failed = Vec::new();
        for (tab_name, result) in results {
            match result {
                Ok(()) => persisted.push(tab_name),
                Err(error) => failed.push(TabFailure { tab_name, error }),
            }
        }

        let view = self
            .instance
            .upsync_mappings_at(snapshot.generation)
            .map_err(|err| {
                warn!(
                    target: "waterfall",
                    event = "mappings_upsync_superseded",
                    instance = %key,
                    persisted = persisted.len(),
                    error = %err
                );
                err.with_context("persisted", persisted.join(","))
            })?;
        info!(
            target: "waterfall",
            event = "mappings_upsynced",
            instance = %key,
            persisted = persisted.len(),
            failed = failed.len()
        );
        Ok(UpsyncReport {
            persisted,
            failed,
            view,
        })
    }

    async fn save_tab(
        &self,
        user_id: &str,
        key: &InstanceKey,
        tab: &Mapping,
    ) -> (String, AppResult<()>) {
        let result = self
            .persistence
            .save_mapping(user_id, key, tab)
            .await
            .map_err(|err| {
                let err = AppError::from(err).with_context("tab", tab.tab_name.clone());
                warn!(
                    target: "waterfall",
                    event = "mapping_persist_failed",
                    tab = %tab.tab_name,
                    instance = %key,
                    error = %err
                );
                err
            });
        (tab.tab_name.clone(), result)
    }
}

fn out_of_range(which: &str, index: usize) -> AppError {
    AppError::new(INDEX_OUT_OF_RANGE, "No mapping cell at that position.")
        .with_context(which, index.to_string())
}
