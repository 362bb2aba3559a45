//! Project -> SQL server -> database -> table navigation tree.
//!
//! Mutations apply locally first and are then persisted. A persistence failure
//! is logged and returned alongside the new tree; local state is kept.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ts_rs::TS;

use crate::model::InstanceKey;
use crate::persistence::PersistenceGateway;
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub const PROJECT_NOT_FOUND: &str = "PROJECT/NOT_FOUND";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Table {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SqlServer {
    pub name: String,
    #[serde(default)]
    pub databases: Vec<Database>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Project {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub sql_servers: Vec<SqlServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional, type = "number")]
    pub updated_at: Option<i64>,
}

/// Appends `incoming` children whose names are new and recurses into the ones
/// that already exist. Order of existing children is preserved.
fn merge_by_name<T, F>(existing: &mut Vec<T>, incoming: Vec<T>, name: fn(&T) -> &str, mut merge: F)
where
    F: FnMut(&mut T, T),
{
    for child in incoming {
        match existing.iter_mut().find(|current| name(current) == name(&child)) {
            Some(current) => merge(current, child),
            None => existing.push(child),
        }
    }
}

impl Database {
    fn merge(&mut self, other: Database) {
        merge_by_name(&mut self.tables, other.tables, |t| &t.name, |_, _| {});
    }
}

impl SqlServer {
    fn merge(&mut self, other: SqlServer) {
        merge_by_name(&mut self.databases, other.databases, |d| &d.name, Database::merge);
    }
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            user_id: user_id.into(),
            sql_servers: Vec::new(),
            updated_at: None,
        }
    }

    /// Builder used by navigation and tests: adds one table path.
    pub fn with_table(mut self, server: &str, database: &str, table: &str) -> Self {
        let path = SqlServer {
            name: server.to_string(),
            databases: vec![Database {
                name: database.to_string(),
                tables: vec![Table {
                    name: table.to_string(),
                }],
            }],
        };
        merge_by_name(&mut self.sql_servers, vec![path], |s| &s.name, SqlServer::merge);
        self
    }

    pub fn merge(&mut self, other: Project) {
        merge_by_name(&mut self.sql_servers, other.sql_servers, |s| &s.name, SqlServer::merge);
    }

    pub fn is_empty(&self) -> bool {
        self.sql_servers.is_empty()
    }

    pub fn contains_table(&self, server: &str, database: &str, table: &str) -> bool {
        self.sql_servers
            .iter()
            .filter(|s| s.name == server)
            .flat_map(|s| s.databases.iter())
            .filter(|d| d.name == database)
            .flat_map(|d| d.tables.iter())
            .any(|t| t.name == table)
    }

    /// Every `(server, database, table)` path, in tree order.
    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        let mut keys = Vec::new();
        for server in &self.sql_servers {
            for database in &server.databases {
                for table in &database.tables {
                    keys.push(InstanceKey {
                        server: server.name.clone(),
                        database: database.name.clone(),
                        table: table.name.clone(),
                    });
                }
            }
        }
        keys
    }

    /// Removes one table. An emptied database goes with it, then an
    /// emptied server. Siblings are left alone.
    fn remove_table(&mut self, server: &str, database: &str, table: &str) -> bool {
        let Some(s) = self.sql_servers.iter().position(|s| s.name == server) else {
            return false;
        };
        let srv = &mut self.sql_servers[s];
        let Some(d) = srv.databases.iter().position(|d| d.name == database) else {
            return false;
        };
        let db = &mut srv.databases[d];
        let before = db.tables.len();
        db.tables.retain(|t| t.name != table);
        if db.tables.len() == before {
            return false;
        }
        if db.tables.is_empty() {
            srv.databases.remove(d);
        }
        if srv.databases.is_empty() {
            self.sql_servers.remove(s);
        }
        true
    }

    fn remove_database(&mut self, server: &str, database: &str) -> bool {
        let Some(s) = self.sql_servers.iter().position(|s| s.name == server) else {
            return false;
        };
        let srv = &mut self.sql_servers[s];
        let before = srv.databases.len();
        srv.databases.retain(|d| d.name != database);
        if srv.databases.len() == before {
            return false;
        }
        if srv.databases.is_empty() {
            self.sql_servers.remove(s);
        }
        true
    }

    fn remove_sql_server(&mut self, server: &str) -> bool {
        let before = self.sql_servers.len();
        self.sql_servers.retain(|s| s.name != server);
        self.sql_servers.len() != before
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PersistAction {
    Create(Project),
    Update(Project),
    Delete(String),
}

/// Result of a tree mutation: the local tree after the change and the
/// persistence failure, if any.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub projects: Arc<Vec<Project>>,
    pub persist_error: Option<AppError>,
}

pub struct ProjectTree {
    persistence: Arc<dyn PersistenceGateway>,
    user_id: RwLock<Option<String>>,
    projects: RwLock<Arc<Vec<Project>>>,
}

impl ProjectTree {
    pub fn new(persistence: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            persistence,
            user_id: RwLock::new(None),
            projects: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn projects(&self) -> Arc<Vec<Project>> {
        self.projects.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.projects().iter().find(|p| p.id == project_id).cloned()
    }

    /// Projects containing the given table.
    pub fn projects_for(&self, key: &InstanceKey) -> Vec<Project> {
        self.projects()
            .iter()
            .filter(|p| p.contains_table(&key.server, &key.database, &key.table))
            .cloned()
            .collect()
    }

    pub async fn init_projects(&self, user_id: &str) -> AppResult<Arc<Vec<Project>>> {
        let loaded = self
            .persistence
            .list_projects(user_id)
            .await
            .map_err(|err| {
                let err = AppError::from(err).with_context("user_id", user_id);
                warn!(target: "waterfall", event = "projects_load_failed", user_id, error = %err);
                err
            })?;
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = Some(user_id.to_string());
        let loaded = Arc::new(loaded);
        *self.projects.write().unwrap_or_else(|e| e.into_inner()) = loaded.clone();
        info!(target: "waterfall", event = "projects_loaded", user_id, count = loaded.len());
        Ok(loaded)
    }

    /// Adds `project`, deep-merging into an existing project with the same id
    /// or name. A project without an id gets a fresh one.
    pub async fn add_project(&self, mut project: Project) -> AppResult<MutationOutcome> {
        let user_id = self.require_user()?;
        let action = self.mutate(|projects| {
            let existing = projects.iter_mut().find(|p| {
                (!project.id.is_empty() && p.id == project.id) || p.name == project.name
            });
            match existing {
                Some(current) => {
                    current.merge(project);
                    current.updated_at = Some(now_ms());
                    Ok(PersistAction::Update(current.clone()))
                }
                None => {
                    if project.id.is_empty() {
                        project.id = uuid::Uuid::now_v7().to_string();
                    }
                    project.user_id = user_id.clone();
                    project.updated_at = Some(now_ms());
                    projects.push(project.clone());
                    Ok(PersistAction::Create(project))
                }
            }
        })?;
        Ok(self.persist(&user_id, action).await)
    }

    pub async fn delete_table(
        &self,
        project_id: &str,
        server: &str,
        database: &str,
        table: &str,
    ) -> AppResult<MutationOutcome> {
        self.remove(project_id, |project| project.remove_table(server, database, table))
            .await
    }

    pub async fn delete_database(
        &self,
        project_id: &str,
        server: &str,
        database: &str,
    ) -> AppResult<MutationOutcome> {
        self.remove(project_id, |project| project.remove_database(server, database))
            .await
    }

    pub async fn delete_sql_server(&self, project_id: &str, server: &str) -> AppResult<MutationOutcome> {
        self.remove(project_id, |project| project.remove_sql_server(server))
            .await
    }

    pub async fn delete_project(&self, project_id: &str) -> AppResult<MutationOutcome> {
        let user_id = self.require_user()?;
        let action = self.mutate(|projects| {
            let before = projects.len();
            projects.retain(|p| p.id != project_id);
            if projects.len() == before {
                return Err(not_found(project_id));
            }
            Ok(PersistAction::Delete(project_id.to_string()))
        })?;
        Ok(self.persist(&user_id, action).await)
    }

    /// Removes a subtree and cascades: an emptied project is deleted.
    async fn remove<F>(&self, project_id: &str, remove: F) -> AppResult<MutationOutcome>
    where
        F: FnOnce(&mut Project) -> bool,
    {
        let user_id = self.require_user()?;
        let action = self.mutate(|projects| {
            let idx = projects
                .iter()
                .position(|p| p.id == project_id)
                .ok_or_else(|| not_found(project_id))?;
            if !remove(&mut projects[idx]) {
                return Err(AppError::new(PROJECT_NOT_FOUND, "Nothing to delete at that path.")
                    .with_context("project_id", project_id));
            }
            if projects[idx].is_empty() {
                projects.remove(idx);
                Ok(PersistAction::Delete(project_id.to_string()))
            } else {
                projects[idx].updated_at = Some(now_ms());
                Ok(PersistAction::Update(projects[idx].clone()))
            }
        })?;
        Ok(self.persist(&user_id, action).await)
    }

    fn require_user(&self) -> AppResult<String> {
        self.user_id().ok_or_else(|| {
            AppError::new("PROJECT/NO_USER", "Projects have not been loaded for a user.")
        })
    }

    fn mutate<F>(&self, apply: F) -> AppResult<PersistAction>
    where
        F: FnOnce(&mut Vec<Project>) -> AppResult<PersistAction>,
    {
        let mut guard = self.projects.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::clone(&guard);
        let action = apply(&mut next)?;
        *guard = Arc::new(next);
        Ok(action)
    }

    async fn persist(&self, user_id: &str, action: PersistAction) -> MutationOutcome {
        let (op, target, result) = match &action {
            PersistAction::Create(project) => (
                "create",
                project.id.as_str(),
                self.persistence.create_project(user_id, project).await,
            ),
            PersistAction::Update(project) => (
                "update",
                project.id.as_str(),
                self.persistence.update_project(user_id, project).await,
            ),
            PersistAction::Delete(project_id) => (
                "delete",
                project_id.as_str(),
                self.persistence.delete_project(user_id, project_id).await,
            ),
        };
        let persist_error = match result {
            Ok(()) => {
                info!(target: "waterfall", event = "project_persisted", op, project_id = target);
                None
            }
            Err(err) => {
                let err = AppError::from(err)
                    .with_context("op", op)
                    .with_context("project_id", target);
                warn!(
                    target: "waterfall",
                    event = "project_persist_failed",
                    op,
                    project_id = target,
                    error = %err
                );
                Some(err)
            }
        };
        MutationOutcome {
            projects: self.projects(),
            persist_error,
        }
    }
}

fn not_found(project_id: &str) -> AppError {
    AppError::new(PROJECT_NOT_FOUND, "Project not found.").with_context("project_id", project_id)
}
