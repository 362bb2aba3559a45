use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheHandle, SqliteCache, StoreStats};
use crate::config::Settings;
use crate::discovery::MappingDiscovery;
use crate::executor::QueryExecutor;
use crate::instance::{InstanceEngine, InstanceOutcome};
use crate::mappings::{MappingsEngine, MappingsOutcome, UpsyncReport};
use crate::model::{Instance, InstanceView};
use crate::persistence::{HttpPersistence, MemoryPersistence, PersistenceGateway};
use crate::projects::ProjectTree;
use crate::sql::{HttpSqlGateway, SqlGateway};
use crate::state::{Snapshot, StateStore};
use crate::{AppError, AppResult};

/// Everything one workbench process holds: the shared cache, the snapshot
/// store, both engines and the project tree.
#[derive(Clone)]
pub struct Workspace {
    cache: CacheHandle,
    state: Arc<StateStore>,
    instance: InstanceEngine,
    mappings: MappingsEngine,
    projects: Arc<ProjectTree>,
}

impl Workspace {
    pub fn new(
        gateway: Arc<dyn SqlGateway>,
        persistence: Arc<dyn PersistenceGateway>,
        cache: CacheHandle,
    ) -> Self {
        let state = Arc::new(StateStore::new());
        let discovery = MappingDiscovery::new(QueryExecutor::new(gateway), cache.clone());
        let instance = InstanceEngine::new(discovery.clone(), state.clone());
        let mappings = MappingsEngine::new(discovery, instance.clone(), persistence.clone());
        Self {
            cache,
            state,
            instance,
            mappings,
            projects: Arc::new(ProjectTree::new(persistence)),
        }
    }

    /// Production wiring: SQLite cache in the data directory, HTTP SQL
    /// gateway, HTTP persistence when an API endpoint is configured.
    pub fn open(settings: &Settings) -> AppResult<Self> {
        let gateway = HttpSqlGateway::new(&settings.sql_endpoint).map_err(AppError::from)?;
        let persistence: Arc<dyn PersistenceGateway> = match &settings.api_endpoint {
            Some(endpoint) => Arc::new(HttpPersistence::new(endpoint).map_err(AppError::from)?),
            None => Arc::new(MemoryPersistence::new()),
        };
        let cache = CacheHandle::sqlite(SqliteCache::open(settings.cache_path()));
        info!(
            target: "waterfall",
            event = "workspace_opened",
            data_dir = %settings.data_dir.display(),
            sql_endpoint = %settings.sql_endpoint,
            remote_projects = settings.api_endpoint.is_some()
        );
        Ok(Self::new(Arc::new(gateway), persistence, cache))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.snapshot()
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn instance(&self) -> &InstanceEngine {
        &self.instance
    }

    pub fn mappings(&self) -> &MappingsEngine {
        &self.mappings
    }

    pub fn projects(&self) -> &Arc<ProjectTree> {
        &self.projects
    }

    pub async fn select_table(&self, instance: Instance) -> InstanceOutcome {
        self.instance.set_instance(instance).await
    }

    /// Opens the mapping tabs of the selected table.
    pub async fn open_mappings(&self) -> AppResult<MappingsOutcome> {
        let instance = self.selected()?;
        self.mappings.set_mappings_state(&instance).await
    }

    pub async fn refresh_mappings(&self) -> AppResult<MappingsOutcome> {
        let instance = self.selected()?;
        self.mappings.refresh_mappings_state(&instance).await
    }

    pub fn modify_waterfall_group(
        &self,
        mapping_index: usize,
        row_index: usize,
        value: impl Into<String>,
    ) -> AppResult<()> {
        self.mappings
            .modify_waterfall_group(mapping_index, row_index, value)
    }

    /// Uploads the mapping tabs for the user the project tree was loaded for.
    pub async fn upsync(&self) -> AppResult<UpsyncReport> {
        let user_id = self.projects.user_id().ok_or_else(|| {
            AppError::new("PROJECT/NO_USER", "Projects have not been loaded for a user.")
        })?;
        self.mappings.upsync_mappings(&user_id).await
    }

    /// Recomputes the keyword pivot from in-memory tabs without uploading.
    pub fn upsync_local(&self) -> AppResult<Arc<InstanceView>> {
        self.instance.upsync_current_mappings()
    }

    pub async fn cache_stats(&self) -> Vec<StoreStats> {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        info!(target: "waterfall", event = "cache_cleared");
    }

    pub async fn shutdown(&self) {
        self.cache.close().await;
    }

    fn selected(&self) -> AppResult<Instance> {
        self.state
            .snapshot()
            .instance
            .clone()
            .ok_or_else(|| AppError::new(crate::instance::INSTANCE_UNSET, "No table is selected."))
    }
}
