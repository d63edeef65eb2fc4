//! The warden engine.
//!
//! One [`CameraWorker`] per RTSP stream drives a per-camera pipeline
//! (detector → primary tracker → appearance stage) and reports confirmed
//! local tracks to the shared [`GlobalResolver`], which maintains the
//! cross-camera identity gallery, the `(camera, local track) → global id`
//! binding map and the change-stream. Background tasks evict stale
//! identities and sync the gallery to the persistence layer. The model
//! server exposes snapshots and the change-stream over HTTP.

mod error;
pub use error::Error;

pub type Result<M> = std::result::Result<M, Error>;

pub mod camera;
pub mod detector;
pub mod embedder;
pub mod model_server;
pub mod pipeline;
pub mod resolver;
pub mod rtsp;
pub mod store;
pub mod tasks;

pub use camera::{CameraWorker, VideoSource, VideoSourceFactory, WorkerState};
pub use detector::{OnnxPersonDetector, PersonDetector};
pub use embedder::{AppearanceEmbedder, OnnxAppearanceEmbedder};
pub use model_server::new_model_server;
pub use pipeline::CameraPipeline;
pub use resolver::GlobalResolver;
pub use store::{GalleryStore, JsonGalleryStore};
