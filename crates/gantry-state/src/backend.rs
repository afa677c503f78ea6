//! State backend trait definition.
//!
//! [`StateBackend`] is the storage contract the engine and worker
//! client drive. Implementations must be `Send + Sync` for use behind
//! `Arc<dyn StateBackend>`.

use chrono::{DateTime, Utc};

use gantry_types::{ContainerMetadata, ContainerOwner, Version, VersionedResourceType};

use crate::error;

/// A persisted container row. `handle` is generated once per
/// `(owner, worker)` pair and remains stable, so retried placements
/// attach to the same runtime container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRow {
    pub id: i64,
    pub handle: String,
    /// False when the row already existed.
    pub created: bool,
}

/// Identity of a cached resource fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCacheDescriptor {
    pub resource_type: String,
    pub version: Option<Version>,
    pub source: serde_json::Value,
    pub params: serde_json::Value,
    pub resource_types: Vec<VersionedResourceType>,
}

impl ResourceCacheDescriptor {
    /// Content-addressed key of this descriptor.
    #[must_use]
    pub fn key(&self) -> String {
        crate::cache_key::resource_cache_key(
            &self.resource_type,
            self.version.as_ref(),
            &self.source,
            &self.params,
            &self.resource_types,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCacheRow {
    pub id: i64,
    pub key: String,
}

/// Record of the most recent check under a scope. Zero-valued times
/// (the Unix epoch) mean the scope has never been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastCheck {
    pub succeeded: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Default for LastCheck {
    fn default() -> Self {
        Self {
            succeeded: false,
            start_time: DateTime::UNIX_EPOCH,
            end_time: DateTime::UNIX_EPOCH,
        }
    }
}

/// What kind of pipeline object a scope can be bound to after a
/// successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckableKind {
    Resource,
    ResourceType,
    Prototype,
}

impl CheckableKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::ResourceType => "resource_type",
            Self::Prototype => "prototype",
        }
    }
}

/// A build artifact slot persisted outside the run's in-memory
/// repository, addressable across builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifactRow {
    pub id: i64,
    pub build_id: i64,
    pub name: String,
    pub worker: String,
    pub volume_handle: String,
}

/// Storage contract for the execution core.
pub trait StateBackend: Send + Sync {
    /// Find or create the container row for `(owner, worker)`.
    /// At most one row exists per pair; concurrent callers observe the
    /// same handle.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        worker: &str,
        metadata: &ContainerMetadata,
    ) -> error::Result<ContainerRow>;

    /// Find or create the cache row for a resource fetch, scoped to a
    /// build so caches outlive the fetch but can be reaped with it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn find_or_create_resource_cache(
        &self,
        build_id: i64,
        descriptor: &ResourceCacheDescriptor,
    ) -> error::Result<ResourceCacheRow>;

    /// Record a volume's authoritative worker. Idempotent per handle.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn record_volume(&self, handle: &str, worker: &str) -> error::Result<()>;

    /// The worker a volume row is keyed to.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn volume_worker(&self, handle: &str) -> error::Result<Option<String>>;

    /// Find or create the scope for `(resource config, resource)`.
    /// `resource` is `None` for resource-type and prototype checks,
    /// which share one scope per config.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn find_or_create_scope(
        &self,
        config_key: &str,
        resource: Option<&str>,
    ) -> error::Result<i64>;

    /// Read the last-check record of a scope. Never-checked scopes
    /// return the zero-valued default.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn last_check(&self, scope_id: i64) -> error::Result<LastCheck>;

    /// Overwrite the last-check record of a scope.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn update_last_check(
        &self,
        scope_id: i64,
        succeeded: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> error::Result<()>;

    /// Try to take the advisory checking lock for a scope. Returns
    /// `false` when another holder has it. Non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn try_acquire_check_lock(&self, scope_id: i64) -> error::Result<bool>;

    /// Release the advisory checking lock. Releasing a lock that is not
    /// held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn release_check_lock(&self, scope_id: i64) -> error::Result<()>;

    /// Record versions discovered by a check, oldest first. Duplicates
    /// of already-recorded versions are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save_versions(&self, scope_id: i64, versions: &[Version]) -> error::Result<()>;

    /// The most recently recorded version under a scope, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn latest_version(&self, scope_id: i64) -> error::Result<Option<Version>>;

    /// Bind a pipeline resource / resource type / prototype to the
    /// scope its versions are now recorded under.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn set_checkable_scope(
        &self,
        pipeline_id: i64,
        kind: CheckableKind,
        name: &str,
        scope_id: i64,
    ) -> error::Result<()>;

    /// The scope a checkable is currently bound to, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn checkable_scope(
        &self,
        pipeline_id: i64,
        kind: CheckableKind,
        name: &str,
    ) -> error::Result<Option<i64>>;

    /// Create or replace a pipeline definition.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save_pipeline(
        &self,
        team: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> error::Result<()>;

    /// The latest-version pointer of a pipeline resource.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn resource_version(
        &self,
        pipeline_id: i64,
        resource: &str,
    ) -> error::Result<Option<Version>>;

    /// Advance the latest-version pointer of a pipeline resource.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn update_resource_version(
        &self,
        pipeline_id: i64,
        resource: &str,
        version: &Version,
    ) -> error::Result<()>;

    /// Persist an artifact produced by a build so later builds can
    /// reference it by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn create_build_artifact(
        &self,
        build_id: i64,
        name: &str,
        worker: &str,
        volume_handle: &str,
    ) -> error::Result<i64>;

    /// Look up a persisted build artifact by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn build_artifact(&self, artifact_id: i64) -> error::Result<Option<BuildArtifactRow>>;
}
