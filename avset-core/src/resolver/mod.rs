mod ytdlp;

use async_trait::async_trait;
use thiserror::Error;

pub use ytdlp::YtDlpResolver;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("extraction failed for {id}: {detail}")]
    Extraction { id: String, detail: String },
    #[error("extractor timed out for {id}")]
    Timeout { id: String },
    #[error("invalid extractor metadata for {id}: {detail}")]
    Metadata { id: String, detail: String },
    #[error("failed to run extractor: {0}")]
    Io(#[from] std::io::Error),
}

pub type ResolverResult<T> = Result<T, ResolverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// Plain progressive HTTP(S), usable directly as an ffmpeg input.
    Direct,
    /// HLS media playlist; ffmpeg can read these directly too.
    HlsPlaylist,
    /// Segmented DASH. Not usable as a direct transcoder input.
    DashSegments,
}

impl StreamProtocol {
    pub fn from_label(label: &str) -> Self {
        match label {
            "http_dash_segments" => StreamProtocol::DashSegments,
            "m3u8" | "m3u8_native" => StreamProtocol::HlsPlaylist,
            _ => StreamProtocol::Direct,
        }
    }

    pub fn is_segmented(self) -> bool {
        matches!(self, StreamProtocol::DashSegments)
    }
}

/// One quality/encoding variant of a remote media item. Fields the remote
/// metadata omits stay `None` and sort below any present value.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub format_id: String,
    pub url: String,
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_bitrate: Option<f64>,
    pub total_bitrate: Option<f64>,
    pub width: Option<u32>,
    pub protocol: StreamProtocol,
}

#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub total_duration: f64,
    pub streams: Vec<StreamDescriptor>,
}

/// Resolves a media identifier into the set of streams available for it.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, media_id: &str) -> ResolverResult<ResolvedMedia>;
}
