use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::command::{CommandRunner, RunOutcome};
use crate::config::ToolsSection;

use super::{ResolvedMedia, ResolverError, ResolverResult, StreamDescriptor, StreamProtocol};

const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream resolver backed by the yt-dlp extractor binary, queried in
/// single-JSON dump mode.
pub struct YtDlpResolver {
    binary: PathBuf,
    page_url_template: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl YtDlpResolver {
    pub fn new(tools: &ToolsSection, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: tools.extractor_path.clone(),
            page_url_template: tools.page_url_template.clone(),
            timeout: DEFAULT_EXTRACTION_TIMEOUT,
            runner,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn page_url(&self, media_id: &str) -> String {
        self.page_url_template.replace("{id}", media_id)
    }
}

#[async_trait]
impl super::StreamResolver for YtDlpResolver {
    async fn resolve(&self, media_id: &str) -> ResolverResult<ResolvedMedia> {
        let args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            self.page_url(media_id),
        ];
        let outcome = self.runner.run(&self.binary, &args, Some(self.timeout)).await?;
        let output = match outcome {
            RunOutcome::TimedOut => {
                return Err(ResolverError::Timeout {
                    id: media_id.to_string(),
                })
            }
            RunOutcome::Completed(output) => output,
        };
        if !output.success() {
            return Err(ResolverError::Extraction {
                id: media_id.to_string(),
                detail: output.stderr.trim().to_string(),
            });
        }
        let info = parse_info(media_id, &output.stdout)?;
        debug!(
            id = media_id,
            duration = info.total_duration,
            streams = info.streams.len(),
            "resolved media"
        );
        Ok(info)
    }
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    duration: Option<f64>,
    formats: Option<Vec<RawFormat>>,
    entries: Option<Vec<RawInfo>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    url: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
    tbr: Option<f64>,
    width: Option<u32>,
    protocol: Option<String>,
}

fn parse_info(media_id: &str, payload: &str) -> ResolverResult<ResolvedMedia> {
    let mut raw: RawInfo = serde_json::from_str(payload).map_err(|err| ResolverError::Metadata {
        id: media_id.to_string(),
        detail: err.to_string(),
    })?;
    // A playlist dump nests the media under `entries`; take the first one.
    if let Some(entry) = raw
        .entries
        .take()
        .and_then(|entries| entries.into_iter().next())
    {
        raw = entry;
    }
    let total_duration = raw.duration.ok_or_else(|| ResolverError::Metadata {
        id: media_id.to_string(),
        detail: "missing duration".to_string(),
    })?;
    let streams = raw
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter_map(descriptor_from_format)
        .collect();
    Ok(ResolvedMedia {
        total_duration,
        streams,
    })
}

fn descriptor_from_format(format: RawFormat) -> Option<StreamDescriptor> {
    let url = format.url?;
    let has_audio = codec_present(format.acodec.as_deref());
    let has_video = codec_present(format.vcodec.as_deref());
    Some(StreamDescriptor {
        format_id: format.format_id.unwrap_or_default(),
        url,
        has_audio,
        has_video,
        audio_bitrate: format.abr,
        total_bitrate: format.tbr,
        width: format.width,
        protocol: format
            .protocol
            .as_deref()
            .map(StreamProtocol::from_label)
            .unwrap_or(StreamProtocol::Direct),
    })
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(name) if name != "none")
}
