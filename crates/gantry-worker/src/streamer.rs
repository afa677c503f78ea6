//! Artifact replication between workers.
//!
//! Same-worker reuse is handled by COW volumes at the call sites; the
//! streamer covers the cross-worker case. Two transfer modes exist with
//! identical semantics: relayed through this process (always
//! available), or peer-to-peer when both workers advertise it.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::WorkerError;
use crate::registry::WorkerRegistry;
use crate::runtime::{Artifact, Volume};
use crate::tarball::Encoding;

#[derive(Clone)]
pub struct Streamer {
    registry: Arc<WorkerRegistry>,
    encoding: Encoding,
    p2p: bool,
}

impl Streamer {
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>, encoding: Encoding, p2p: bool) -> Self {
        Self {
            registry,
            encoding,
            p2p,
        }
    }

    /// Replicate an artifact's volume into `dest` (a volume on another
    /// worker). After the transfer, a get artifact's cache identity is
    /// recorded on the destination so later fetches of the same version
    /// short-circuit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when either side fails mid-transfer.
    pub async fn stream(
        &self,
        artifact: &Artifact,
        dest: &Arc<dyn Volume>,
    ) -> Result<(), WorkerError> {
        let source = self.registry.volume_for_artifact(artifact).await?;
        let source_agent = self.registry.get(&artifact.worker)?;
        let dest_agent = self.registry.get(dest.worker())?;

        let p2p = self.p2p
            && source_agent.info().p2p_streaming
            && dest_agent.info().p2p_streaming;
        if p2p {
            let url = dest.stream_in_p2p_url(".").await?;
            tracing::debug!(
                from = artifact.worker,
                to = dest.worker(),
                url,
                "streaming artifact peer-to-peer"
            );
            source_agent
                .stream_p2p(&artifact.volume, ".", &url, self.encoding)
                .await?;
        } else {
            tracing::debug!(
                from = artifact.worker,
                to = dest.worker(),
                encoding = %self.encoding,
                "streaming artifact through the core"
            );
            let content = source.stream_out(".", self.encoding).await?;
            dest.stream_in(".", self.encoding, content).await?;
        }

        if let Some(cache_key) = &artifact.resource_cache_key {
            dest.initialize_streamed_resource_cache(cache_key, &artifact.worker)
                .await?;
        }
        Ok(())
    }

    /// Produce the framed tar stream of an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the source volume is gone.
    pub async fn stream_out(&self, artifact: &Artifact) -> Result<Bytes, WorkerError> {
        let source = self.registry.volume_for_artifact(artifact).await?;
        source.stream_out(".", self.encoding).await
    }

    /// Open a single file from within an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stream`] when the file does not exist.
    pub async fn stream_file(
        &self,
        artifact: &Artifact,
        path: &str,
    ) -> Result<Bytes, WorkerError> {
        let source = self.registry.volume_for_artifact(artifact).await?;
        source.stream_file(path).await
    }
}
