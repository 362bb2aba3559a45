//! State synchronization and caching core of the waterfall cohort workbench.
//!
//! Selecting a table runs [`instance::InstanceEngine::set_instance`], which
//! discovers the table's mapping keywords and loads its aggregates through the
//! cache. Mapping tabs are loaded, edited and uploaded through
//! [`mappings::MappingsEngine`]. [`Workspace`] wires both to one cache and one
//! snapshot store.

pub mod cache;
pub mod config;
pub mod discovery;
mod error;
pub mod executor;
pub mod instance;
pub mod logging;
pub mod mappings;
pub mod model;
pub mod persistence;
pub mod projects;
pub mod sql;
pub mod state;
pub mod time;
pub mod workspace;

pub use error::{AppError, AppResult};
pub use logging::init_logging;
pub use workspace::Workspace;
