use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::model::{Instance, InstanceKey, InstanceView, Mapping};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "errors")]
pub enum LoadStatus {
    Unset,
    Loading,
    Ready,
    /// Loaded, but some aggregates fell back to empty or zero.
    ReadyWithErrors(Vec<AppError>),
}

impl LoadStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadStatus::Ready | LoadStatus::ReadyWithErrors(_))
    }
}

/// Mapping tabs for one instance. `loaded` distinguishes "never fetched" from
/// "fetched and the table has no mapping keywords".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingsState {
    pub instance: Option<InstanceKey>,
    pub loaded: bool,
    pub tabs: Vec<Arc<Mapping>>,
}

impl MappingsState {
    pub fn empty_for(instance: Option<InstanceKey>) -> Self {
        Self {
            instance,
            loaded: false,
            tabs: Vec::new(),
        }
    }

    pub fn is_loaded_for(&self, key: &InstanceKey) -> bool {
        self.loaded && self.instance.as_ref() == Some(key)
    }

    pub fn tab(&self, tab_name: &str) -> Option<&Arc<Mapping>> {
        self.tabs.iter().find(|tab| tab.tab_name == tab_name)
    }
}

/// Immutable view of everything the UI binds to. Replaced wholesale on every
/// commit; untouched parts are shared with the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub generation: u64,
    pub instance: Option<Instance>,
    pub status: LoadStatus,
    pub view: Arc<InstanceView>,
    pub mappings: Arc<MappingsState>,
}

impl Snapshot {
    fn unset() -> Self {
        Self {
            generation: 0,
            instance: None,
            status: LoadStatus::Unset,
            view: Arc::new(InstanceView::default()),
            mappings: Arc::new(MappingsState::default()),
        }
    }

    pub fn instance_key(&self) -> Option<InstanceKey> {
        self.instance.as_ref().map(Instance::key)
    }
}

pub struct StateStore {
    current: RwLock<Arc<Snapshot>>,
    refreshing: Arc<AtomicBool>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::unset())),
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Starts loading `instance` under a fresh generation. Returns the
    /// generation and the mappings currently held for the same instance, if any.
    pub fn begin_instance(&self, instance: Instance) -> (u64, Option<Arc<MappingsState>>) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let key = instance.key();
        let prior = guard
            .mappings
            .is_loaded_for(&key)
            .then(|| guard.mappings.clone());
        let generation = guard.generation + 1;
        *guard = Arc::new(Snapshot {
            generation,
            instance: Some(instance),
            status: LoadStatus::Loading,
            view: Arc::new(InstanceView::default()),
            mappings: Arc::new(MappingsState::empty_for(Some(key))),
        });
        (generation, prior)
    }

    /// Applies `apply` only if no newer instance has been set since
    /// `generation` was captured. Returns whether the commit happened.
    pub fn update<F>(&self, generation: u64, apply: F) -> bool
    where
        F: FnOnce(&mut Snapshot),
    {
        let outcome = self.update_with(generation, |snap| {
            apply(snap);
            true
        });
        outcome == Commit::Applied
    }

    /// Like [`StateStore::update`], but `apply` may decline by returning
    /// `false`, in which case the current snapshot is kept as is.
    pub fn update_with<F>(&self, generation: u64, apply: F) -> Commit
    where
        F: FnOnce(&mut Snapshot) -> bool,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if guard.generation != generation {
            return Commit::Stale;
        }
        let mut next = Snapshot::clone(&guard);
        if !apply(&mut next) {
            return Commit::Declined;
        }
        *guard = Arc::new(next);
        Commit::Applied
    }

    /// Mutates the current snapshot. Nothing is committed when `apply` fails.
    pub fn try_update_current<F, R>(&self, apply: F) -> AppResult<R>
    where
        F: FnOnce(&mut Snapshot) -> AppResult<R>,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Snapshot::clone(&guard);
        let result = apply(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    pub fn begin_refresh(&self) -> AppResult<RefreshGuard> {
        RefreshGuard::begin(self.refreshing.clone())
    }

    pub fn refresh_active(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Applied,
    Declined,
    /// A newer instance was set after the generation was captured.
    Stale,
}

pub struct RefreshGuard {
    flag: Arc<AtomicBool>,
}

impl RefreshGuard {
    pub const IN_PROGRESS: &'static str = "MAPPINGS/REFRESH_IN_PROGRESS";

    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                Self::IN_PROGRESS,
                "A mappings refresh is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
