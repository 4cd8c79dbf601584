use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use avset_core::command::{CommandOutput, CommandRunner, RunOutcome};
use avset_core::config::{AvsetConfig, VideoMode};
use avset_core::download::SegmentDownloader;
use avset_core::resolver::{
    ResolvedMedia, ResolverResult, StreamDescriptor, StreamProtocol, StreamResolver,
};
use avset_core::scheduler::{JobScheduler, FAILURE_LEDGER_FILENAME};

struct FakeResolver {
    media: ResolvedMedia,
    calls: Mutex<usize>,
}

impl FakeResolver {
    fn new(media: ResolvedMedia) -> Self {
        Self {
            media,
            calls: Mutex::new(0),
        }
    }

    fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl StreamResolver for FakeResolver {
    async fn resolve(&self, _media_id: &str) -> ResolverResult<ResolvedMedia> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.media.clone())
    }
}

/// Stands in for ffmpeg and ffprobe. ffmpeg invocations are recorded and
/// create their output file; ffprobe answers with metadata matching the
/// stock configuration and the configured duration.
struct FakeToolchain {
    ffmpeg_calls: Mutex<Vec<Vec<String>>>,
    probe_duration: f64,
    fail_ffmpeg: bool,
    fail_merge: bool,
}

impl FakeToolchain {
    fn new(probe_duration: f64) -> Self {
        Self {
            ffmpeg_calls: Mutex::new(Vec::new()),
            probe_duration,
            fail_ffmpeg: false,
            fail_merge: false,
        }
    }

    fn failing(probe_duration: f64) -> Self {
        Self {
            fail_ffmpeg: true,
            ..Self::new(probe_duration)
        }
    }

    /// Single-input passes succeed; the two-input merge pass fails.
    fn failing_merge(probe_duration: f64) -> Self {
        Self {
            fail_merge: true,
            ..Self::new(probe_duration)
        }
    }

    fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.ffmpeg_calls.lock().unwrap().clone()
    }

    fn probe_payload(&self, target: &str) -> String {
        if target.ends_with(".flac") {
            format!(
                r#"{{"streams":[{{"codec_type":"audio","codec_name":"flac","sample_rate":"48000","channels":2}}],"format":{{"duration":"{}"}}}}"#,
                self.probe_duration
            )
        } else {
            format!(
                r#"{{"streams":[{{"codec_type":"video","codec_name":"h264","avg_frame_rate":"30/1"}},{{"codec_type":"audio","codec_name":"aac","sample_rate":"48000","channels":2}}],"format":{{"duration":"{}"}}}}"#,
                self.probe_duration
            )
        }
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> std::io::Result<RunOutcome> {
        let tool = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match tool.as_str() {
            "ffmpeg" => {
                self.ffmpeg_calls.lock().unwrap().push(args.to_vec());
                let is_merge = args.iter().filter(|arg| *arg == "-i").count() == 2;
                if self.fail_ffmpeg || (self.fail_merge && is_merge) {
                    return Ok(RunOutcome::Completed(CommandOutput {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: "Conversion failed!".to_string(),
                    }));
                }
                // Output path sits before the trailing -loglevel pair.
                let output_path = &args[args.len() - 3];
                std::fs::write(output_path, b"media")?;
                Ok(RunOutcome::Completed(CommandOutput {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                }))
            }
            "ffprobe" => {
                let target = args.last().cloned().unwrap_or_default();
                Ok(RunOutcome::Completed(CommandOutput {
                    exit_code: Some(0),
                    stdout: self.probe_payload(&target),
                    stderr: String::new(),
                }))
            }
            other => panic!("unexpected tool invocation: {other}"),
        }
    }
}

fn stream(
    format_id: &str,
    has_audio: bool,
    has_video: bool,
    audio_bitrate: Option<f64>,
    total_bitrate: Option<f64>,
    width: Option<u32>,
) -> StreamDescriptor {
    StreamDescriptor {
        format_id: format_id.to_string(),
        url: format!("https://cdn/{format_id}"),
        has_audio,
        has_video,
        audio_bitrate,
        total_bitrate,
        width,
        protocol: StreamProtocol::Direct,
    }
}

fn standard_media() -> ResolvedMedia {
    ResolvedMedia {
        total_duration: 100.0,
        streams: vec![
            stream("a-high", true, false, Some(130.9), None, None),
            stream("v-640", true, true, None, Some(800.0), Some(640)),
            stream("v-1280", true, true, None, Some(1662.9), Some(1280)),
        ],
    }
}

fn build_scheduler(
    config: AvsetConfig,
    resolver: Arc<FakeResolver>,
    runner: Arc<FakeToolchain>,
) -> JobScheduler {
    let config = Arc::new(config);
    let workers = config.jobs.num_workers;
    let downloader = Arc::new(SegmentDownloader::new(config, resolver, runner));
    JobScheduler::new(downloader, workers)
}

fn write_subset(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("eval_segments.csv");
    std::fs::write(&path, contents).unwrap();
    path
}

const STANDARD_SUBSET: &str = "\
# Segments csv
#YTID, start_seconds, end_seconds, positive_labels
abc123, 10.0, 15.0, \"/m/09x0r\"
not a segment row
";

#[tokio::test]
async fn downloads_segment_and_skips_it_on_rerun() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, STANDARD_SUBSET);
    let dataset_dir = base.path().join("dataset");

    let resolver = Arc::new(FakeResolver::new(standard_media()));
    let runner = Arc::new(FakeToolchain::new(5.0));
    let scheduler = build_scheduler(
        AvsetConfig::default(),
        Arc::clone(&resolver),
        Arc::clone(&runner),
    );

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.subset, "eval_segments");
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.skipped_malformed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let audio = dataset_dir.join("eval_segments/audio/abc123_10000_15000.flac");
    let video = dataset_dir.join("eval_segments/video/abc123_10000_15000.mp4");
    assert!(audio.exists());
    assert!(video.exists());

    // Audio then video, and the widest combined stream wins.
    let calls = runner.ffmpeg_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains(&"https://cdn/a-high".to_string()));
    assert!(calls[1].contains(&"https://cdn/v-1280".to_string()));

    // Re-running performs no further transcoder work.
    let rerun = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(rerun.scheduled, 0);
    assert_eq!(rerun.skipped_complete, 1);
    assert_eq!(runner.ffmpeg_calls().len(), 2);
    assert_eq!(resolver.call_count(), 1);
}

#[tokio::test]
async fn audio_falls_back_to_video_stream_url() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 0.0, 5.0\n");
    let dataset_dir = base.path().join("dataset");

    let media = ResolvedMedia {
        total_duration: 100.0,
        streams: vec![
            stream("v-640", true, true, None, Some(800.0), Some(640)),
            stream("v-1280", true, true, None, Some(1662.9), Some(1280)),
        ],
    };
    let resolver = Arc::new(FakeResolver::new(media));
    let runner = Arc::new(FakeToolchain::new(5.0));
    let scheduler = build_scheduler(AvsetConfig::default(), resolver, Arc::clone(&runner));

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let calls = runner.ffmpeg_calls();
    let audio_call = calls
        .iter()
        .find(|call| call.iter().any(|arg| arg.ends_with(".flac")))
        .expect("audio invocation");
    assert!(audio_call.contains(&"https://cdn/v-1280".to_string()));
}

#[tokio::test]
async fn ledgered_segments_are_never_submitted() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 10.0, 15.0\n");
    let dataset_dir = base.path().join("dataset");
    std::fs::create_dir_all(&dataset_dir).unwrap();
    std::fs::write(
        dataset_dir.join(FAILURE_LEDGER_FILENAME),
        "abc123,'previous failure'\n",
    )
    .unwrap();

    let resolver = Arc::new(FakeResolver::new(standard_media()));
    let runner = Arc::new(FakeToolchain::new(5.0));
    let scheduler = build_scheduler(
        AvsetConfig::default(),
        Arc::clone(&resolver),
        Arc::clone(&runner),
    );

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.scheduled, 0);
    assert_eq!(report.skipped_failed, 1);
    assert_eq!(resolver.call_count(), 0);
    assert!(runner.ffmpeg_calls().is_empty());
}

#[tokio::test]
async fn segment_past_media_end_is_clamped() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 10.0, 20.0\n");
    let dataset_dir = base.path().join("dataset");

    let media = ResolvedMedia {
        total_duration: 18.0,
        ..standard_media()
    };
    let resolver = Arc::new(FakeResolver::new(media));
    // The produced files report the clamped duration of exactly 8 seconds.
    let runner = Arc::new(FakeToolchain::new(8.0));
    let scheduler = build_scheduler(AvsetConfig::default(), resolver, Arc::clone(&runner));

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    // Filenames keep the requested boundaries; ffmpeg gets the clamped -t.
    assert!(dataset_dir
        .join("eval_segments/audio/abc123_10000_20000.flac")
        .exists());
    let calls = runner.ffmpeg_calls();
    let t_index = calls[0].iter().position(|arg| arg == "-t").unwrap();
    assert_eq!(calls[0][t_index + 1], "8");
}

#[tokio::test]
async fn terminal_failures_land_in_the_ledger() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 10.0, 15.0\n");
    let dataset_dir = base.path().join("dataset");

    let mut config = AvsetConfig::default();
    config.jobs.num_retries = 2;
    let resolver = Arc::new(FakeResolver::new(standard_media()));
    let runner = Arc::new(FakeToolchain::failing(5.0));
    let scheduler = build_scheduler(config.clone(), Arc::clone(&resolver), Arc::clone(&runner));

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(runner.ffmpeg_calls().len(), 2);

    let ledger = std::fs::read_to_string(dataset_dir.join(FAILURE_LEDGER_FILENAME)).unwrap();
    assert!(ledger.starts_with("abc123,'"));

    // The next run skips the segment without resolving it again.
    let scheduler = build_scheduler(config, Arc::clone(&resolver), Arc::clone(&runner));
    let rerun = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(rerun.skipped_failed, 1);
    assert_eq!(rerun.scheduled, 0);
    assert_eq!(resolver.call_count(), 1);
}

#[tokio::test]
async fn merge_mode_replaces_lossless_video_with_merged_output() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 10.0, 15.0\n");
    let dataset_dir = base.path().join("dataset");

    let mut config = AvsetConfig::default();
    config.video.mode = VideoMode::BestVideoWithAudio;
    let media = ResolvedMedia {
        total_duration: 100.0,
        streams: vec![
            stream("a-high", true, false, Some(130.9), None, None),
            stream("vo-1280", false, true, None, Some(1530.3), Some(1280)),
            stream("v-640", true, true, None, Some(800.0), Some(640)),
        ],
    };
    let resolver = Arc::new(FakeResolver::new(media));
    let runner = Arc::new(FakeToolchain::new(5.0));
    let scheduler = build_scheduler(config, resolver, Arc::clone(&runner));

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    // Audio, lossless video, then the two-input merge.
    let calls = runner.ffmpeg_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].contains(&"https://cdn/vo-1280".to_string()));
    assert!(calls[1].contains(&"-an".to_string()));
    let merge_inputs = calls[2].iter().filter(|arg| *arg == "-i").count();
    assert_eq!(merge_inputs, 2);

    let video_dir = dataset_dir.join("eval_segments/video");
    assert!(video_dir.join("abc123_10000_15000.mp4").exists());
    assert!(!video_dir.join("abc123_10000_15000_merge.mp4").exists());
}

#[tokio::test]
async fn failed_merge_keeps_lossless_video_and_ledgers_segment() {
    let base = TempDir::new().unwrap();
    let subset_path = write_subset(&base, "abc123, 10.0, 15.0\n");
    let dataset_dir = base.path().join("dataset");

    let mut config = AvsetConfig::default();
    config.video.mode = VideoMode::BestVideoWithAudio;
    config.jobs.num_retries = 2;
    let media = ResolvedMedia {
        total_duration: 100.0,
        streams: vec![
            stream("a-high", true, false, Some(130.9), None, None),
            stream("vo-1280", false, true, None, Some(1530.3), Some(1280)),
        ],
    };
    let resolver = Arc::new(FakeResolver::new(media));
    let runner = Arc::new(FakeToolchain::failing_merge(5.0));
    let scheduler = build_scheduler(config, resolver, Arc::clone(&runner));

    let report = scheduler
        .run_subset(subset_path.to_str().unwrap(), &dataset_dir)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 1);

    // Audio, lossless video, then the merge retried to exhaustion.
    assert_eq!(runner.ffmpeg_calls().len(), 4);

    // The lossless video is left behind for inspection, the merge
    // temporary is not.
    let video_dir = dataset_dir.join("eval_segments/video");
    assert!(video_dir.join("abc123_10000_15000.mp4").exists());
    assert!(!video_dir.join("abc123_10000_15000_merge.mp4").exists());
    assert!(dataset_dir
        .join("eval_segments/audio/abc123_10000_15000.flac")
        .exists());

    let ledger = std::fs::read_to_string(dataset_dir.join(FAILURE_LEDGER_FILENAME)).unwrap();
    assert!(ledger.starts_with("abc123,'"));
}
