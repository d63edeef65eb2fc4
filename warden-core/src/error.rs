#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Types {
        #[from]
        source: warden_types::WardenTypesError,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid RTSP url: {0}")]
    BadRtspUrl(String),
    #[error("RTSP error: {0}")]
    Rtsp(String),
    #[error("stream has no H.264 video track")]
    NoVideoStream,
    #[error("stream ended")]
    StreamEnded,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("inference error: {0}")]
    Inference(String),
    #[error("crop too small for embedding ({width}x{height})")]
    CropTooSmall { width: u32, height: u32 },
    #[error("gallery store error: {0}")]
    Store(String),
    #[error("invalid resolver input: {0}")]
    InvalidInput(&'static str),
}

impl From<retina::Error> for Error {
    fn from(e: retina::Error) -> Self {
        Error::Rtsp(e.to_string())
    }
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::Inference(e.to_string())
    }
}
