//! Pure stream-selection heuristics.
//!
//! Selection never considers segmented-DASH descriptors (the transcoder
//! cannot read them as a direct input) and all sorts are stable, so ties
//! keep the resolver's original ordering.

use std::cmp::Ordering;

use thiserror::Error;

use crate::config::VideoMode;
use crate::resolver::StreamDescriptor;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no usable video stream for mode {mode}")]
    NoUsableVideo { mode: VideoMode },
}

/// Best audio-only stream by descending audio bitrate, or `None` when the
/// media offers no standalone audio stream.
pub fn best_audio_stream(streams: &[StreamDescriptor]) -> Option<&StreamDescriptor> {
    let mut candidates: Vec<&StreamDescriptor> = streams
        .iter()
        .filter(|s| !s.protocol.is_segmented() && s.has_audio && !s.has_video)
        .collect();
    candidates.sort_by(|a, b| {
        let left = b.audio_bitrate.unwrap_or(0.0);
        let right = a.audio_bitrate.unwrap_or(0.0);
        left.partial_cmp(&right).unwrap_or(Ordering::Equal)
    });
    candidates.first().copied()
}

/// Best video stream for the requested mode, sorted descending by
/// `(width, total bitrate)`.
///
/// `BestVideo` and `BestVideoWithAudio` prefer a video-only stream and fall
/// back to one carrying audio; `BestVideoAudio` variants require a stream
/// carrying both tracks. `Ok(None)` only for `VideoMode::None`.
pub fn best_video_stream(
    streams: &[StreamDescriptor],
    mode: VideoMode,
) -> Result<Option<&StreamDescriptor>, SelectError> {
    if mode == VideoMode::None {
        return Ok(None);
    }
    let video_only = sorted_video_streams(streams, false);
    let video_with_audio = sorted_video_streams(streams, true);
    let chosen = match mode {
        VideoMode::BestVideo | VideoMode::BestVideoWithAudio => video_only
            .first()
            .or_else(|| video_with_audio.first())
            .copied(),
        VideoMode::BestVideoAudio | VideoMode::BestVideoAudioNoAudio => {
            video_with_audio.first().copied()
        }
        VideoMode::None => unreachable!("handled above"),
    };
    chosen
        .map(Some)
        .ok_or(SelectError::NoUsableVideo { mode })
}

fn sorted_video_streams(streams: &[StreamDescriptor], with_audio: bool) -> Vec<&StreamDescriptor> {
    let mut candidates: Vec<&StreamDescriptor> = streams
        .iter()
        .filter(|s| !s.protocol.is_segmented() && s.has_video && s.has_audio == with_audio)
        .collect();
    candidates.sort_by(|a, b| video_sort_key(b).partial_cmp(&video_sort_key(a)).unwrap_or(Ordering::Equal));
    candidates
}

fn video_sort_key(stream: &StreamDescriptor) -> (u32, f64) {
    (
        stream.width.unwrap_or(0),
        stream.total_bitrate.unwrap_or(0.0),
    )
}
