//! Resolving a step's image spec to a rootfs on the target worker.
//!
//! Four paths: an image artifact already on the worker (COW it), an
//! image artifact on another worker (stream, then COW), a base
//! resource type installed on the worker (import keyed by version,
//! then COW), or a passthrough URL.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gantry_types::Version;

use crate::error::WorkerError;
use crate::runtime::{Artifact, VolumeSpec, VolumeStrategy, WorkerAgent};
use crate::streamer::Streamer;

/// URL scheme for rootfs paths local to the worker.
pub const RAW_ROOTFS_SCHEME: &str = "raw";

/// Well-known metadata file inside image artifacts.
pub const IMAGE_METADATA_FILE: &str = "metadata.json";

/// `metadata.json` schema. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: String,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone)]
pub enum ImageSpec {
    /// A previous step's output (e.g. a built container image).
    Artifact {
        artifact: Artifact,
        privileged: bool,
    },
    /// A base resource type installed on the worker.
    ResourceType(String),
    /// Passthrough URL; no metadata.
    Url(String),
}

/// A resolved image, ready to hand to the container runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedImage {
    pub metadata: ImageMetadata,
    pub version: Option<Version>,
    pub url: String,
    pub privileged: bool,
}

fn load_metadata(raw: &[u8]) -> Result<ImageMetadata, WorkerError> {
    serde_json::from_slice(raw).map_err(|err| {
        WorkerError::MalformedMetadata(format!("{IMAGE_METADATA_FILE}: {err}"))
    })
}

/// Resolve `spec` to a local privileged COW rootfs on `worker`.
///
/// # Errors
///
/// Returns [`WorkerError::UnsupportedResourceType`] for unknown base
/// types, [`WorkerError::MalformedMetadata`] for bad `metadata.json`,
/// other [`WorkerError`] values for volume or stream failures.
pub async fn fetch_image_for_container(
    streamer: &Streamer,
    worker: &Arc<dyn WorkerAgent>,
    spec: &ImageSpec,
) -> Result<FetchedImage, WorkerError> {
    match spec {
        ImageSpec::Artifact {
            artifact,
            privileged,
        } => {
            if artifact.worker == worker.name() {
                image_from_local_artifact(streamer, worker, artifact, *privileged).await
            } else {
                image_from_remote_artifact(streamer, worker, artifact, *privileged).await
            }
        }
        ImageSpec::ResourceType(name) => image_from_base_resource_type(worker, name).await,
        ImageSpec::Url(url) => Ok(FetchedImage {
            url: url.clone(),
            ..FetchedImage::default()
        }),
    }
}

async fn image_from_local_artifact(
    streamer: &Streamer,
    worker: &Arc<dyn WorkerAgent>,
    artifact: &Artifact,
    privileged: bool,
) -> Result<FetchedImage, WorkerError> {
    let volume = worker
        .find_volume(&artifact.volume)
        .await?
        .ok_or_else(|| WorkerError::VolumeNotFound {
            worker: artifact.worker.clone(),
            handle: artifact.volume.clone(),
        })?;

    let image_volume = volume.cow(privileged).await?;
    let metadata = load_metadata(&streamer.stream_file(artifact, IMAGE_METADATA_FILE).await?)?;

    Ok(FetchedImage {
        metadata,
        version: None,
        url: format!("{RAW_ROOTFS_SCHEME}://{}/rootfs", image_volume.path()),
        privileged,
    })
}

async fn image_from_remote_artifact(
    streamer: &Streamer,
    worker: &Arc<dyn WorkerAgent>,
    artifact: &Artifact,
    privileged: bool,
) -> Result<FetchedImage, WorkerError> {
    let streamed_volume = worker
        .create_volume(VolumeSpec {
            strategy: VolumeStrategy::Empty,
            privileged,
        })
        .await?;
    streamer.stream(artifact, &streamed_volume).await?;
    tracing::debug!(
        from = artifact.worker,
        to = worker.name(),
        "streamed non-local image volume"
    );

    let image_volume = streamed_volume.cow(privileged).await?;
    let metadata = load_metadata(&streamer.stream_file(artifact, IMAGE_METADATA_FILE).await?)?;

    Ok(FetchedImage {
        metadata,
        version: None,
        url: format!("{RAW_ROOTFS_SCHEME}://{}/rootfs", image_volume.path()),
        privileged,
    })
}

async fn image_from_base_resource_type(
    worker: &Arc<dyn WorkerAgent>,
    resource_type_name: &str,
) -> Result<FetchedImage, WorkerError> {
    let resource_type = worker
        .info()
        .resource_types
        .into_iter()
        .find(|rt| rt.resource_type == resource_type_name)
        .ok_or_else(|| WorkerError::UnsupportedResourceType(resource_type_name.to_string()))?;

    let import_volume = worker
        .find_or_create_base_type_volume(&resource_type)
        .await?;
    let cow_volume = import_volume.cow(resource_type.privileged).await?;

    Ok(FetchedImage {
        metadata: ImageMetadata::default(),
        version: Some(Version::from_pairs([(
            resource_type_name,
            resource_type.version.as_str(),
        )])),
        url: format!("{RAW_ROOTFS_SCHEME}://{}", cow_volume.path()),
        privileged: resource_type.privileged,
    })
}
