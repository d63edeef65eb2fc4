//! Configuration file handling for warden.
//!
//! One TOML file describes the whole deployment: engine-level settings, the
//! parameter blocks for tracking and resolution, and the camera list.

use serde::{Deserialize, Serialize};

use warden_types::{
    CameraParams, EmbedderParams, ResolverParams, SecondaryParams, TrackingParams,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("config path is not valid UTF-8")]
    NonUtf8Path,
}

type Result<T> = std::result::Result<T, Error>;

fn default_model_server_addr() -> std::net::SocketAddr {
    "127.0.0.1:8397".parse().unwrap()
}

/// Engine-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Address of the HTTP port emitting snapshots and the change-stream.
    #[serde(default = "default_model_server_addr")]
    pub model_server_addr: std::net::SocketAddr,
    /// Gallery snapshot file. Absent means memory-only operation. Can
    /// contain shell variables such as `~`, `$A`, or `${B}`.
    pub gallery_path: Option<std::path::PathBuf>,
    /// ONNX person detection model. Can contain shell variables.
    pub detector_model: std::path::PathBuf,
    /// ONNX appearance (re-id) model. Absent disables the appearance
    /// pipeline; cross-camera matching then relies on spatial overlap only.
    pub embedder_model: Option<std::path::PathBuf>,
}

impl std::default::Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_server_addr: default_model_server_addr(),
            gallery_path: Some(std::path::PathBuf::from("warden-gallery.jsonl")),
            detector_model: std::path::PathBuf::from("/path/to/detector.onnx"),
            embedder_model: Some(std::path::PathBuf::from("/path/to/embedder.onnx")),
        }
    }
}

/// One camera entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    /// Numeric camera id, unique across the deployment.
    pub id: u32,
    /// Human-readable name (e.g. "vault-entrance").
    pub name: String,
    pub rtsp_url: String,
    /// Ingest parameters; omitted fields take their defaults.
    #[serde(default)]
    pub params: CameraParams,
}

impl CameraConfig {
    pub fn default_for(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            rtsp_url: format!("rtsp://127.0.0.1:8554/{name}"),
            params: CameraParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub tracking: TrackingParams,
    #[serde(default)]
    pub secondary: SecondaryParams,
    #[serde(default)]
    pub embedder: EmbedderParams,
    #[serde(default)]
    pub resolver: ResolverParams,
    pub cameras: Vec<CameraConfig>,
}

impl std::default::Default for WardenConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tracking: TrackingParams::default(),
            secondary: SecondaryParams::default(),
            embedder: EmbedderParams::default(),
            resolver: ResolverParams::default(),
            cameras: vec![
                CameraConfig::default_for(1, "camera-1"),
                CameraConfig::default_for(2, "camera-2"),
            ],
        }
    }
}

/// Split `path` (which must be a file) into directory and filename
/// components.
fn split_path<P: AsRef<std::path::Path>>(path: P) -> (std::path::PathBuf, std::path::PathBuf) {
    let path = path.as_ref();
    assert!(path.is_file());
    let mut components = path.components();
    let filename = components.next_back().unwrap().as_os_str().into();
    let dirname = components.as_path().into();
    (dirname, filename)
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is
/// expanded to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path.as_os_str().to_str().ok_or(Error::NonUtf8Path)?;
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

impl WardenConfig {
    /// For all paths which are relative, make them relative to the config
    /// file location.
    fn fixup_relative_paths(&mut self, orig_path: &std::path::Path) -> Result<()> {
        let (dirname, _orig_fname) = split_path(orig_path);

        if let Some(gallery_path) = self.engine.gallery_path.as_mut() {
            fixup_relative_path(gallery_path, &dirname)?;
        }
        fixup_relative_path(&mut self.engine.detector_model, &dirname)?;
        if let Some(embedder_model) = self.engine.embedder_model.as_mut() {
            fixup_relative_path(embedder_model, &dirname)?;
        }
        Ok(())
    }
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<WardenConfig> {
    use std::io::Read;

    let mut file = std::fs::File::open(fname.as_ref())?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let mut cfg: WardenConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(fname.as_ref())?;
    Ok(cfg)
}
