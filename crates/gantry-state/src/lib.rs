//! Durable state storage for the gantry build execution core.
//!
//! [`StateBackend`] defines the storage contract for container rows,
//! content-addressed resource caches, resource config scopes (with
//! last-check records and advisory check locks), pipelines, and build
//! artifact slots. [`SqliteStateBackend`] is the bundled
//! implementation.

pub mod backend;
pub mod cache_key;
pub mod error;
pub mod sqlite;

pub use backend::{
    BuildArtifactRow, CheckableKind, ContainerRow, LastCheck, ResourceCacheDescriptor,
    ResourceCacheRow, StateBackend,
};
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
