//! ffprobe-backed validation of transcoded output files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::command::{CommandRunner, RunOutcome};

/// Tolerated drift between the requested and the produced duration.
pub const DURATION_TOLERANCE: f64 = 0.1;

/// Why a produced file was rejected. The retry engine dispatches a
/// different corrective action per variant.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("output duration {actual:.3}s does not match expected {expected:.3}s")]
    DurationMismatch { expected: f64, actual: f64 },
    #[error("output could not be opened: {detail}")]
    Unopenable { detail: String },
    #[error("output failed validation: {detail}")]
    Mismatch { detail: String },
}

/// Expectations the validator holds a produced file against. Only the
/// populated fields are checked, so one context type serves both tracks.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub expected_duration: f64,
    /// Set when the requested end time was clamped to the media's end; a
    /// shortfall up to the clamped expectation is then acceptable.
    pub end_past_media_end: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub codec_name: Option<String>,
    pub frame_rate: Option<u32>,
}

impl ValidationContext {
    pub fn audio(
        duration: f64,
        end_past_media_end: bool,
        sample_rate: u32,
        channels: u32,
        codec_name: &str,
    ) -> Self {
        Self {
            expected_duration: duration,
            end_past_media_end,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            codec_name: Some(codec_name.to_lowercase()),
            frame_rate: None,
        }
    }

    pub fn video(
        duration: f64,
        end_past_media_end: bool,
        frame_rate: u32,
        codec_name: &str,
    ) -> Self {
        Self {
            expected_duration: duration,
            end_past_media_end,
            sample_rate: None,
            channels: None,
            codec_name: Some(codec_name.to_lowercase()),
            frame_rate: Some(frame_rate),
        }
    }
}

#[async_trait]
pub trait OutputValidator: Send + Sync {
    async fn validate(&self, path: &Path, ctx: &ValidationContext) -> Result<(), ValidationError>;
}

pub struct FfprobeValidator {
    ffprobe: PathBuf,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl FfprobeValidator {
    pub fn new(ffprobe: PathBuf, timeout: Duration, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ffprobe,
            timeout,
            runner,
        }
    }

    async fn probe(&self, path: &Path) -> Result<ProbeOutput, ValidationError> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let outcome = self
            .runner
            .run(&self.ffprobe, &args, Some(self.timeout))
            .await
            .map_err(|err| ValidationError::Unopenable {
                detail: err.to_string(),
            })?;
        let output = match outcome {
            RunOutcome::TimedOut => {
                return Err(ValidationError::Unopenable {
                    detail: "ffprobe timed out".to_string(),
                })
            }
            RunOutcome::Completed(output) => output,
        };
        if !output.success() {
            return Err(ValidationError::Unopenable {
                detail: output.stderr.trim().to_string(),
            });
        }
        serde_json::from_str(&output.stdout).map_err(|err| ValidationError::Unopenable {
            detail: format!("unparseable ffprobe output: {err}"),
        })
    }
}

#[async_trait]
impl OutputValidator for FfprobeValidator {
    async fn validate(&self, path: &Path, ctx: &ValidationContext) -> Result<(), ValidationError> {
        let probe = self.probe(path).await?;

        let actual_duration = probe
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| ValidationError::Mismatch {
                detail: "probe reported no duration".to_string(),
            })?;
        check_duration(ctx.expected_duration, actual_duration, ctx.end_past_media_end)?;

        if ctx.sample_rate.is_some() || ctx.channels.is_some() {
            let stream = probe.stream("audio").ok_or_else(|| ValidationError::Mismatch {
                detail: "no audio stream in output".to_string(),
            })?;
            if let Some(expected) = ctx.sample_rate {
                let actual = stream
                    .sample_rate
                    .as_deref()
                    .and_then(|r| r.parse::<u32>().ok());
                if actual != Some(expected) {
                    return Err(ValidationError::Mismatch {
                        detail: format!("sample rate {actual:?}, expected {expected}"),
                    });
                }
            }
            if let Some(expected) = ctx.channels {
                if stream.channels != Some(expected) {
                    return Err(ValidationError::Mismatch {
                        detail: format!("channels {:?}, expected {expected}", stream.channels),
                    });
                }
            }
            if let Some(expected) = ctx.codec_name.as_deref() {
                check_codec(stream, expected)?;
            }
        }

        if let Some(expected_rate) = ctx.frame_rate {
            let stream = probe.stream("video").ok_or_else(|| ValidationError::Mismatch {
                detail: "no video stream in output".to_string(),
            })?;
            let actual = stream
                .avg_frame_rate
                .as_deref()
                .and_then(parse_frame_rate);
            match actual {
                Some(rate) if (rate - expected_rate as f64).abs() < 0.5 => {}
                other => {
                    return Err(ValidationError::Mismatch {
                        detail: format!("frame rate {other:?}, expected {expected_rate}"),
                    })
                }
            }
            if let Some(expected) = ctx.codec_name.as_deref() {
                check_codec(stream, expected)?;
            }
        }

        Ok(())
    }
}

fn check_codec(stream: &ProbeStream, expected: &str) -> Result<(), ValidationError> {
    let actual = stream.codec_name.as_deref().unwrap_or("");
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ValidationError::Mismatch {
            detail: format!("codec {actual:?}, expected {expected}"),
        });
    }
    Ok(())
}

/// Exact-duration check with the clamp exception: when the requested end ran
/// past the media's end, the expectation is already clamped and any output
/// not exceeding it passes.
pub fn check_duration(
    expected: f64,
    actual: f64,
    end_past_media_end: bool,
) -> Result<(), ValidationError> {
    let diff = expected - actual;
    if diff.abs() <= DURATION_TOLERANCE {
        return Ok(());
    }
    if end_past_media_end && actual <= expected + DURATION_TOLERANCE {
        return Ok(());
    }
    Err(ValidationError::DurationMismatch { expected, actual })
}

/// Parses an ffprobe frame-rate fraction such as `"30/1"`.
fn parse_frame_rate(value: &str) -> Option<f64> {
    let (numerator, denominator) = value.split_once('/')?;
    let numerator: f64 = numerator.trim().parse().ok()?;
    let denominator: f64 = denominator.trim().parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    streams: Option<Vec<ProbeStream>>,
    format: Option<ProbeFormat>,
}

impl ProbeOutput {
    fn stream(&self, codec_type: &str) -> Option<&ProbeStream> {
        self.streams
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(codec_type))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}
