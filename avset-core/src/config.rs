use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Top-level configuration for the dataset downloader. Every field has a
/// default that matches a stock flac/48kHz audio + h264/mp4 video setup, so
/// an empty TOML file (or no file at all) is a valid starting point.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AvsetConfig {
    pub tools: ToolsSection,
    pub audio: AudioSection,
    pub video: VideoSection,
    pub jobs: JobsSection,
}

impl AvsetConfig {
    /// Rejects option combinations that would only fail mid-batch.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.num_retries == 0 {
            return Err(ConfigError::Invalid(
                "num_retries must be greater than zero".into(),
            ));
        }
        if self.jobs.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "num_workers must be greater than zero".into(),
            ));
        }
        if self.video.mode.is_merge() && self.video.codec != "h264" {
            return Err(ConfigError::Invalid(format!(
                "merging lossless video with audio is only supported for h264, not {}",
                self.video.codec
            )));
        }
        Ok(())
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.jobs.transcode_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub extractor_path: PathBuf,
    /// Template turning a media identifier into the page URL handed to the
    /// extractor. `{id}` is replaced with the identifier.
    pub page_url_template: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            extractor_path: PathBuf::from("yt-dlp"),
            page_url_template: "https://www.youtube.com/watch?v={id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub codec: String,
    pub format: String,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            codec: "flac".to_string(),
            format: "flac".to_string(),
            sample_rate: 48_000,
            bit_depth: 16,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoSection {
    pub mode: VideoMode,
    pub codec: String,
    pub format: String,
    pub frame_rate: u32,
}

impl Default for VideoSection {
    fn default() -> Self {
        Self {
            mode: VideoMode::BestVideoAudio,
            codec: "h264".to_string(),
            format: "mp4".to_string(),
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub num_retries: u32,
    pub num_workers: usize,
    pub transcode_timeout_seconds: u64,
    /// ffmpeg `-loglevel` value.
    pub ffmpeg_log_level: String,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            num_retries: 10,
            num_workers: 4,
            transcode_timeout_seconds: 60,
            ffmpeg_log_level: "error".to_string(),
        }
    }
}

/// How the video track of a segment is obtained.
///
/// `BestVideo` takes the best stream without audio, `BestVideoAudio` the best
/// stream carrying both tracks, `BestVideoAudioNoAudio` the latter with the
/// audio track stripped, and `BestVideoWithAudio` downloads lossless video
/// separately and merges it with the already-extracted audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    None,
    BestVideo,
    #[default]
    BestVideoAudio,
    BestVideoAudioNoAudio,
    BestVideoWithAudio,
}

impl VideoMode {
    pub fn wants_video(self) -> bool {
        !matches!(self, VideoMode::None)
    }

    pub fn is_merge(self) -> bool {
        matches!(self, VideoMode::BestVideoWithAudio)
    }

    pub fn suppress_audio(self) -> bool {
        matches!(self, VideoMode::BestVideo | VideoMode::BestVideoAudioNoAudio)
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VideoMode::None => "none",
            VideoMode::BestVideo => "bestvideo",
            VideoMode::BestVideoAudio => "bestvideoaudio",
            VideoMode::BestVideoAudioNoAudio => "bestvideoaudionoaudio",
            VideoMode::BestVideoWithAudio => "bestvideowithaudio",
        };
        f.write_str(label)
    }
}

impl FromStr for VideoMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "" | "none" => Ok(VideoMode::None),
            "bestvideo" => Ok(VideoMode::BestVideo),
            "bestvideoaudio" => Ok(VideoMode::BestVideoAudio),
            "bestvideoaudionoaudio" => Ok(VideoMode::BestVideoAudioNoAudio),
            "bestvideowithaudio" => Ok(VideoMode::BestVideoWithAudio),
            other => Err(ConfigError::Invalid(format!("invalid video mode: {other}"))),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AvsetConfig> {
    let config: AvsetConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
