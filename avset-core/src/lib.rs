pub mod command;
pub mod config;
pub mod download;
pub mod error;
pub mod ledger;
pub mod resolver;
pub mod scheduler;
pub mod select;
pub mod transcode;
pub mod validate;

pub use command::{CommandOutput, CommandRunner, RunOutcome, SystemCommandRunner};
pub use config::{load_config, AvsetConfig, VideoMode};
pub use download::{
    DownloadError, DownloadResult, MediaTrack, SegmentArtifacts, SegmentDownloader, SegmentRequest,
};
pub use error::{ConfigError, Result};
pub use ledger::{FailureLedger, FailureRecord, LedgerError};
pub use resolver::{
    ResolvedMedia, ResolverError, StreamDescriptor, StreamProtocol, StreamResolver, YtDlpResolver,
};
pub use scheduler::{BatchReport, JobScheduler, ScheduleError, ScheduleResult};
pub use select::{best_audio_stream, best_video_stream, SelectError};
pub use transcode::{TranscodeOutcome, TranscodeSpec, Transcoder};
pub use validate::{FfprobeValidator, OutputValidator, ValidationContext, ValidationError};
