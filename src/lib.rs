//! Near-duplicate photo browsing core.
//!
//! Lists the images of a directory, keeps a per-directory cache of quality
//! scores, capture metadata, face boxes and pairwise distances, and groups
//! shots into clusters under an adjustable similarity threshold.

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod tasks;

pub use cache::{DirectoryCache, FieldKind, FieldSet, Record};
pub use config::{Config, ConfigError};
pub use crate::core::similarity::{Algorithm, SimilarityConfig};
pub use engine::{
    ClearRequest, EngineError, Progress, RefreshSummary, Session, SessionOptions, SessionState,
};
pub use tasks::{TaskError, TaskRunner, TaskTrace};
