use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use avset_core::{
    AvsetConfig, JobScheduler, ScheduleError, SegmentDownloader, SystemCommandRunner, VideoMode,
    YtDlpResolver,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] avset_core::ConfigError),
    #[error("scheduling error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Bulk downloader for labeled audio/video segment datasets", long_about = None)]
pub struct Cli {
    /// Segment list to download: local CSV path or http(s) URL
    #[arg(long, value_name = "PATH_OR_URL")]
    pub segments: String,
    /// Directory where the dataset is stored
    #[arg(long, value_name = "DIR")]
    pub output_dir: PathBuf,
    /// Optional TOML config file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Number of segments downloaded concurrently
    #[arg(short, long)]
    pub jobs: Option<usize>,
    /// Video handling mode (none, bestvideo, bestvideoaudio,
    /// bestvideoaudionoaudio, bestvideowithaudio)
    #[arg(long)]
    pub video_mode: Option<String>,
    /// Path to the ffmpeg executable
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
    /// Path to the ffprobe executable
    #[arg(long)]
    pub ffprobe: Option<PathBuf>,
    /// Path to the metadata extractor executable
    #[arg(long)]
    pub extractor: Option<PathBuf>,
    /// Attempts per transcoder invocation
    #[arg(long)]
    pub num_retries: Option<u32>,
    /// Per-attempt transcoder timeout in seconds
    #[arg(long)]
    pub transcode_timeout: Option<u64>,
    /// Print debug-level progress
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    fn build_config(&self) -> Result<AvsetConfig> {
        let mut config = match &self.config {
            Some(path) => avset_core::load_config(path)?,
            None => AvsetConfig::default(),
        };
        if let Some(jobs) = self.jobs {
            config.jobs.num_workers = jobs;
        }
        if let Some(mode) = &self.video_mode {
            config.video.mode = mode.parse::<VideoMode>()?;
        }
        if let Some(path) = &self.ffmpeg {
            config.tools.ffmpeg_path = path.clone();
        }
        if let Some(path) = &self.ffprobe {
            config.tools.ffprobe_path = path.clone();
        }
        if let Some(path) = &self.extractor {
            config.tools.extractor_path = path.clone();
        }
        if let Some(retries) = self.num_retries {
            config.jobs.num_retries = retries;
        }
        if let Some(seconds) = self.transcode_timeout {
            config.jobs.transcode_timeout_seconds = seconds;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Arc::new(cli.build_config()?);
    info!(
        segments = %cli.segments,
        output_dir = %cli.output_dir.display(),
        video_mode = %config.video.mode,
        workers = config.jobs.num_workers,
        "starting batch"
    );
    let runner = Arc::new(SystemCommandRunner);
    let resolver = Arc::new(YtDlpResolver::new(&config.tools, runner.clone()));
    let downloader = Arc::new(SegmentDownloader::new(
        Arc::clone(&config),
        resolver,
        runner,
    ));
    let scheduler = JobScheduler::new(downloader, config.jobs.num_workers);

    let report = scheduler.run_subset(&cli.segments, &cli.output_dir).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec!["avsetctl", "--segments", "eval.csv", "--output-dir", "/data"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn flags_override_defaults() {
        let cli = cli(&["--jobs", "8", "--video-mode", "none", "--num-retries", "2"]);
        let config = cli.build_config().unwrap();
        assert_eq!(config.jobs.num_workers, 8);
        assert_eq!(config.video.mode, VideoMode::None);
        assert_eq!(config.jobs.num_retries, 2);
    }

    #[test]
    fn invalid_video_mode_is_rejected() {
        let cli = cli(&["--video-mode", "bestaudio"]);
        assert!(cli.build_config().is_err());
    }
}
