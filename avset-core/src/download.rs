//! Per-segment download orchestration: stream selection, boundary
//! handling, and the audio/video/merge transcode sequence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::command::CommandRunner;
use crate::config::AvsetConfig;
use crate::resolver::{ResolverError, StreamDescriptor, StreamResolver};
use crate::select::{best_audio_stream, best_video_stream};
use crate::transcode::{TranscodeOutcome, TranscodeSpec, Transcoder};
use crate::validate::{FfprobeValidator, ValidationContext};

/// One row of the segment list: a media identifier plus the requested
/// excerpt boundaries in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub id: String,
    pub start: f64,
    pub end: f64,
}

impl SegmentRequest {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Base filename shared by the segment's artifacts:
    /// `<id>_<start_ms>_<end_ms>`. Computed from the requested boundaries,
    /// never the clamped ones, so re-runs find the same path.
    pub fn media_filename(&self) -> String {
        format!(
            "{}_{}_{}",
            self.id,
            (self.start * 1000.0).round() as i64,
            (self.end * 1000.0).round() as i64
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTrack {
    Audio,
    Video,
    Merge,
}

impl fmt::Display for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaTrack::Audio => f.write_str("audio"),
            MediaTrack::Video => f.write_str("video"),
            MediaTrack::Merge => f.write_str("merge"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Resolution(#[from] ResolverError),
    #[error("segment {id} starts at {start}s, past the end of the media ({total}s)")]
    StartPastMediaEnd { id: String, start: f64, total: f64 },
    #[error("no usable stream for segment {id}: {detail}")]
    NoUsableStream { id: String, detail: String },
    #[error("{track} track failed for segment {id} after {attempts} attempts: {detail}")]
    TrackFailed {
        id: String,
        track: MediaTrack,
        attempts: u32,
        detail: String,
    },
    #[error("merged video missing for segment {id}; lossless video left at {path}")]
    MergeIncomplete { id: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[derive(Debug, Clone)]
pub struct SegmentArtifacts {
    pub audio_path: PathBuf,
    pub video_path: Option<PathBuf>,
}

pub struct SegmentDownloader {
    config: Arc<AvsetConfig>,
    resolver: Arc<dyn StreamResolver>,
    transcoder: Transcoder,
    validator: FfprobeValidator,
}

impl SegmentDownloader {
    pub fn new(
        config: Arc<AvsetConfig>,
        resolver: Arc<dyn StreamResolver>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let transcoder = Transcoder::new(&config, Arc::clone(&runner));
        let validator = FfprobeValidator::new(
            config.tools.ffprobe_path.clone(),
            config.transcode_timeout(),
            runner,
        );
        Self {
            config,
            resolver,
            transcoder,
            validator,
        }
    }

    pub fn audio_path(&self, data_dir: &Path, request: &SegmentRequest) -> PathBuf {
        data_dir.join("audio").join(format!(
            "{}.{}",
            request.media_filename(),
            self.config.audio.format
        ))
    }

    pub fn video_path(&self, data_dir: &Path, request: &SegmentRequest) -> PathBuf {
        data_dir.join("video").join(format!(
            "{}.{}",
            request.media_filename(),
            self.config.video.format
        ))
    }

    /// Artifact existence is the sole completion signal: audio must exist,
    /// and video too when the mode requests it.
    pub fn is_complete(&self, data_dir: &Path, request: &SegmentRequest) -> bool {
        let audio_exists = self.audio_path(data_dir, request).exists();
        if self.config.video.mode.wants_video() {
            audio_exists && self.video_path(data_dir, request).exists()
        } else {
            audio_exists
        }
    }

    pub async fn download(
        &self,
        data_dir: &Path,
        request: &SegmentRequest,
    ) -> DownloadResult<SegmentArtifacts> {
        let resolved = self.resolver.resolve(&request.id).await?;

        let mut duration = request.duration();
        let mut end_past_media_end = false;
        if request.end > resolved.total_duration {
            if request.start >= resolved.total_duration {
                return Err(DownloadError::StartPastMediaEnd {
                    id: request.id.clone(),
                    start: request.start,
                    total: resolved.total_duration,
                });
            }
            duration = resolved.total_duration - request.start;
            end_past_media_end = true;
            warn!(
                id = %request.id,
                start = request.start,
                end = request.end,
                total = resolved.total_duration,
                "segment end extends past end of media, clamping"
            );
        }

        let mode = self.config.video.mode;
        let best_video = best_video_stream(&resolved.streams, mode).map_err(|err| {
            DownloadError::NoUsableStream {
                id: request.id.clone(),
                detail: err.to_string(),
            }
        })?;
        let best_audio = best_audio_stream(&resolved.streams);
        // A video stream carrying audio still serves as an audio source;
        // the transcoder extracts the track.
        let audio_url = best_audio
            .map(|s| s.url.clone())
            .or_else(|| best_video.map(|s| s.url.clone()))
            .ok_or_else(|| DownloadError::NoUsableStream {
                id: request.id.clone(),
                detail: "no audio or video stream available".to_string(),
            })?;

        let audio_path = self.audio_path(data_dir, request);
        self.download_audio(request, &audio_url, &audio_path, duration, end_past_media_end)
            .await?;

        if !mode.wants_video() {
            info!(id = %request.id, "downloaded segment (audio only)");
            return Ok(SegmentArtifacts {
                audio_path,
                video_path: None,
            });
        }

        let video = best_video.ok_or_else(|| DownloadError::NoUsableStream {
            id: request.id.clone(),
            detail: "no video stream available".to_string(),
        })?;
        let video_path = self.video_path(data_dir, request);
        if mode.is_merge() {
            self.download_merged_video(
                request,
                video,
                &audio_path,
                &video_path,
                duration,
                end_past_media_end,
            )
            .await?;
        } else {
            self.download_video(request, video, &video_path, duration, end_past_media_end)
                .await?;
        }

        info!(id = %request.id, start = request.start, end = request.end, "downloaded segment");
        Ok(SegmentArtifacts {
            audio_path,
            video_path: Some(video_path),
        })
    }

    async fn download_audio(
        &self,
        request: &SegmentRequest,
        source_url: &str,
        audio_path: &Path,
        duration: f64,
        end_past_media_end: bool,
    ) -> DownloadResult<()> {
        let audio = &self.config.audio;
        let spec = TranscodeSpec {
            inputs: vec![source_url.to_string()],
            output: audio_path.to_path_buf(),
            input_args: vec!["-n".into(), "-ss".into(), request.start.to_string()],
            output_args: vec![
                "-t".into(),
                duration.to_string(),
                "-ar".into(),
                audio.sample_rate.to_string(),
                "-vn".into(),
                "-ac".into(),
                audio.channels.to_string(),
                "-sample_fmt".into(),
                format!("s{}", audio.bit_depth),
                "-f".into(),
                audio.format.clone(),
                "-acodec".into(),
                audio.codec.clone(),
            ],
        };
        let ctx = ValidationContext::audio(
            duration,
            end_past_media_end,
            audio.sample_rate,
            audio.channels,
            &audio.codec,
        );
        self.run_track(request, MediaTrack::Audio, spec, Some(&ctx))
            .await
    }

    async fn download_video(
        &self,
        request: &SegmentRequest,
        video: &StreamDescriptor,
        video_path: &Path,
        duration: f64,
        end_past_media_end: bool,
    ) -> DownloadResult<()> {
        let config = &self.config.video;
        let mut output_args = vec![
            "-t".to_string(),
            duration.to_string(),
            "-f".to_string(),
            config.format.clone(),
            "-r".to_string(),
            config.frame_rate.to_string(),
            "-vcodec".to_string(),
            config.codec.clone(),
        ];
        if config.mode.suppress_audio() {
            output_args.push("-an".to_string());
        }
        let spec = TranscodeSpec {
            inputs: vec![video.url.clone()],
            output: video_path.to_path_buf(),
            input_args: vec!["-n".into(), "-ss".into(), request.start.to_string()],
            output_args,
        };
        let ctx = ValidationContext::video(
            duration,
            end_past_media_end,
            config.frame_rate,
            &config.codec,
        );
        self.run_track(request, MediaTrack::Video, spec, Some(&ctx))
            .await
    }

    /// Lossless video pass followed by a merge with the already-produced
    /// audio. The merged file atomically replaces the lossless one; if the
    /// merge never materializes, the lossless video stays behind for
    /// inspection and the segment counts as failed.
    async fn download_merged_video(
        &self,
        request: &SegmentRequest,
        video: &StreamDescriptor,
        audio_path: &Path,
        video_path: &Path,
        duration: f64,
        end_past_media_end: bool,
    ) -> DownloadResult<()> {
        let config = &self.config.video;
        let lossless_spec = TranscodeSpec {
            inputs: vec![video.url.clone()],
            output: video_path.to_path_buf(),
            input_args: vec!["-n".into(), "-ss".into(), request.start.to_string()],
            output_args: vec![
                "-t".into(),
                duration.to_string(),
                "-f".into(),
                config.format.clone(),
                "-crf".into(),
                "0".into(),
                "-preset".into(),
                "medium".into(),
                "-r".into(),
                config.frame_rate.to_string(),
                "-an".into(),
                "-vcodec".into(),
                config.codec.clone(),
            ],
        };
        self.run_track(request, MediaTrack::Video, lossless_spec, None)
            .await?;

        let merge_path = merge_sibling_path(video_path, &config.format);
        let merge_spec = TranscodeSpec {
            inputs: vec![
                video_path.to_string_lossy().into_owned(),
                audio_path.to_string_lossy().into_owned(),
            ],
            output: merge_path.clone(),
            input_args: vec!["-n".into()],
            output_args: vec![
                "-f".into(),
                config.format.clone(),
                "-r".into(),
                config.frame_rate.to_string(),
                "-vcodec".into(),
                config.codec.clone(),
                "-acodec".into(),
                "aac".into(),
                "-ar".into(),
                self.config.audio.sample_rate.to_string(),
                "-ac".into(),
                self.config.audio.channels.to_string(),
                "-strict".into(),
                "experimental".into(),
            ],
        };
        let ctx = ValidationContext::video(
            duration,
            end_past_media_end,
            config.frame_rate,
            &config.codec,
        );
        let outcome = self
            .transcoder
            .run(merge_spec, Some((&self.validator, &ctx)))
            .await;
        if let TranscodeOutcome::Exhausted { .. } = &outcome {
            error!(
                id = %request.id,
                path = %merge_path.display(),
                "cannot produce merged video, keeping lossless-only file"
            );
            return Err(DownloadError::MergeIncomplete {
                id: request.id.clone(),
                path: video_path.to_path_buf(),
            });
        }
        if !merge_path.exists() {
            error!(
                id = %request.id,
                path = %merge_path.display(),
                "merged video missing after transcode, keeping lossless-only file"
            );
            return Err(DownloadError::MergeIncomplete {
                id: request.id.clone(),
                path: video_path.to_path_buf(),
            });
        }

        tokio::fs::remove_file(video_path)
            .await
            .map_err(|source| DownloadError::Io {
                source,
                path: video_path.to_path_buf(),
            })?;
        tokio::fs::rename(&merge_path, video_path)
            .await
            .map_err(|source| DownloadError::Io {
                source,
                path: merge_path.clone(),
            })?;
        Ok(())
    }

    async fn run_track(
        &self,
        request: &SegmentRequest,
        track: MediaTrack,
        spec: TranscodeSpec,
        ctx: Option<&ValidationContext>,
    ) -> DownloadResult<()> {
        let validator = ctx.map(|ctx| {
            (
                &self.validator as &dyn crate::validate::OutputValidator,
                ctx,
            )
        });
        match self.transcoder.run(spec, validator).await {
            TranscodeOutcome::Completed { .. } | TranscodeOutcome::AlreadyExists => Ok(()),
            TranscodeOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(DownloadError::TrackFailed {
                id: request.id.clone(),
                track,
                attempts,
                detail: last_error,
            }),
        }
    }
}

/// `<stem>_merge.<format>` next to the final video path.
fn merge_sibling_path(video_path: &Path, format: &str) -> PathBuf {
    let stem = video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    video_path.with_file_name(format!("{stem}_merge.{format}"))
}
