//! Worker-facing half of the gantry execution core.
//!
//! Owns worker placement, the container/volume client traits the core
//! drives (the worker agent itself is an external collaborator), the
//! image fetcher, and the artifact streamer. [`mem`] provides an
//! in-process worker agent used by tests and local development.

pub mod client;
pub mod error;
pub mod image;
pub mod mem;
pub mod placement;
pub mod registry;
pub mod runtime;
pub mod streamer;
pub mod tarball;

pub use client::{ContainerSpec, InputMount, OutputSpec, StepClient};
pub use error::WorkerError;
pub use image::{FetchedImage, ImageMetadata, ImageSpec};
pub use placement::{PlacementChain, PlacementStrategy, WorkerSpec};
pub use registry::WorkerRegistry;
pub use runtime::{Artifact, ProcessIo, ProcessSpec, WorkerAgent};
pub use streamer::Streamer;
pub use tarball::Encoding;
