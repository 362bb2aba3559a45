//! Remote persistence of projects and mapping tabs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::model::{InstanceKey, Mapping};
use crate::projects::Project;
use crate::AppError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("persistence endpoint unreachable: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl PersistError {
    fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            404 => PersistError::NotFound(message),
            409 => PersistError::Conflict(message),
            401 | 403 => PersistError::Unauthorized(message),
            _ => PersistError::Server(format!("{status}: {message}")),
        }
    }
}

impl From<PersistError> for AppError {
    fn from(err: PersistError) -> Self {
        let code = match &err {
            PersistError::NotFound(_) => "PERSIST/NOT_FOUND",
            PersistError::Conflict(_) => AppError::PERSIST_CONFLICT,
            PersistError::Unauthorized(_) => "PERSIST/UNAUTHORIZED",
            PersistError::Server(_) => "PERSIST/SERVER",
            PersistError::Transport(_) => "PERSIST/TRANSPORT",
            PersistError::Decode(_) => "PERSIST/DECODE",
        };
        AppError::new(code, err.to_string())
    }
}

impl From<reqwest::Error> for PersistError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PersistError::Decode(err.to_string())
        } else {
            PersistError::Transport(err.to_string())
        }
    }
}

pub trait PersistenceGateway: Send + Sync {
    fn list_projects<'a>(&'a self, user_id: &'a str)
        -> BoxFuture<'a, Result<Vec<Project>, PersistError>>;
    fn create_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>>;
    fn update_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>>;
    fn delete_project<'a>(
        &'a self,
        user_id: &'a str,
        project_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PersistError>>;
    /// Stores one mapping tab as a single write.
    fn save_mapping<'a>(
        &'a self,
        user_id: &'a str,
        instance: &'a InstanceKey,
        mapping: &'a Mapping,
    ) -> BoxFuture<'a, Result<(), PersistError>>;
}

/// REST client for `<endpoint>/users/{user}/...`.
#[derive(Debug, Clone)]
pub struct HttpPersistence {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpPersistence {
    pub fn new(endpoint: &str) -> Result<Self, PersistError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PersistError::Transport(format!("failed to create HTTP client: {e}")))?;
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| PersistError::Transport(format!("invalid endpoint {endpoint}: {e}")))?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, PersistError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| PersistError::Transport("endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PersistError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(PersistError::from_status(status, message))
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: reqwest::Url,
        body: &T,
    ) -> Result<(), PersistError> {
        let response = self.client.request(method, url).json(body).send().await?;
        Self::check(response).await.map(|_| ())
    }
}

impl PersistenceGateway for HttpPersistence {
    fn list_projects<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Project>, PersistError>> {
        Box::pin(async move {
            let url = self.url(&["users", user_id, "projects"])?;
            let response = Self::check(self.client.get(url).send().await?).await?;
            Ok(response.json::<Vec<Project>>().await?)
        })
    }

    fn create_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let url = self.url(&["users", user_id, "projects"])?;
            self.send_json(reqwest::Method::POST, url, project).await
        })
    }

    fn update_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let url = self.url(&["users", user_id, "projects", &project.id])?;
            self.send_json(reqwest::Method::PUT, url, project).await
        })
    }

    fn delete_project<'a>(
        &'a self,
        user_id: &'a str,
        project_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let url = self.url(&["users", user_id, "projects", project_id])?;
            let response = self.client.delete(url).send().await?;
            Self::check(response).await.map(|_| ())
        })
    }

    fn save_mapping<'a>(
        &'a self,
        user_id: &'a str,
        instance: &'a InstanceKey,
        mapping: &'a Mapping,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let url = self.url(&[
                "users",
                user_id,
                "mappings",
                &instance.server,
                &instance.database,
                &instance.table,
                &mapping.tab_name,
            ])?;
            self.send_json(reqwest::Method::PUT, url, mapping).await
        })
    }
}

type MappingSlot = (String, InstanceKey, String);

/// Process-local persistence, used offline and by tests.
#[derive(Default)]
pub struct MemoryPersistence {
    projects: Mutex<HashMap<String, Vec<Project>>>,
    mappings: Mutex<HashMap<MappingSlot, Mapping>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_mapping(&self, user_id: &str, instance: &InstanceKey, tab_name: &str) -> Option<Mapping> {
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), instance.clone(), tab_name.to_string()))
            .cloned()
    }

    pub fn stored_projects(&self, user_id: &str) -> Vec<Project> {
        self.projects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl PersistenceGateway for MemoryPersistence {
    fn list_projects<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Project>, PersistError>> {
        Box::pin(async move { Ok(self.stored_projects(user_id)) })
    }

    fn create_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let mut guard = self.projects.lock().unwrap_or_else(|e| e.into_inner());
            let projects = guard.entry(user_id.to_string()).or_default();
            if projects.iter().any(|p| p.id == project.id) {
                return Err(PersistError::Conflict(format!("project {} exists", project.id)));
            }
            projects.push(project.clone());
            Ok(())
        })
    }

    fn update_project<'a>(
        &'a self,
        user_id: &'a str,
        project: &'a Project,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let mut guard = self.projects.lock().unwrap_or_else(|e| e.into_inner());
            let slot = guard
                .get_mut(user_id)
                .and_then(|projects| projects.iter_mut().find(|p| p.id == project.id))
                .ok_or_else(|| PersistError::NotFound(format!("project {}", project.id)))?;
            *slot = project.clone();
            Ok(())
        })
    }

    fn delete_project<'a>(
        &'a self,
        user_id: &'a str,
        project_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let mut guard = self.projects.lock().unwrap_or_else(|e| e.into_inner());
            let projects = guard
                .get_mut(user_id)
                .ok_or_else(|| PersistError::NotFound(format!("project {project_id}")))?;
            let before = projects.len();
            projects.retain(|p| p.id != project_id);
            if projects.len() == before {
                return Err(PersistError::NotFound(format!("project {project_id}")));
            }
            Ok(())
        })
    }

    fn save_mapping<'a>(
        &'a self,
        user_id: &'a str,
        instance: &'a InstanceKey,
        mapping: &'a Mapping,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            self.mappings.lock().unwrap_or_else(|e| e.into_inner()).insert(
                (user_id.to_string(), instance.clone(), mapping.tab_name.clone()),
                mapping.clone(),
            );
            Ok(())
        })
    }
}
