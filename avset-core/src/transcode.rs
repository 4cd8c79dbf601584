//! ffmpeg invocation wrapped in a bounded, failure-classifying retry loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::command::{CommandRunner, RunOutcome};
use crate::config::AvsetConfig;
use crate::validate::{OutputValidator, ValidationContext, ValidationError};

/// One transcoder invocation: one or two inputs, one output, and the
/// argument lists placed before and after the inputs. `input_args` and
/// `output_args` may be rewritten between attempts (duration correction).
#[derive(Debug, Clone)]
pub struct TranscodeSpec {
    pub inputs: Vec<String>,
    pub output: PathBuf,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum TranscodeOutcome {
    Completed { attempts: u32 },
    /// A previous run already produced the output file.
    AlreadyExists,
    Exhausted { attempts: u32, last_error: String },
}

impl TranscodeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TranscodeOutcome::Exhausted { .. })
    }
}

#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("transient http failure: {0}")]
    Transient(String),
    #[error("ffmpeg failed: {0}")]
    Process(String),
    #[error("ffmpeg timed out")]
    Timeout,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

enum AttemptSuccess {
    Done,
    AlreadyExists,
}

pub struct Transcoder {
    ffmpeg: PathBuf,
    log_level: String,
    retry_budget: u32,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    http_error: Regex,
}

impl Transcoder {
    pub fn new(config: &AvsetConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ffmpeg: config.tools.ffmpeg_path.clone(),
            log_level: config.jobs.ffmpeg_log_level.clone(),
            retry_budget: config.jobs.num_retries,
            timeout: config.transcode_timeout(),
            runner,
            // 4xx/5xx responses surface in ffmpeg's stderr like
            // "Server returned 404 Not Found" or "HTTP error 503 ...".
            http_error: Regex::new(r"(HTTP error|Server returned) [45]\d\d")
                .expect("static regex"),
        }
    }

    /// Runs one transcode to completion, retrying up to the budget. Never
    /// returns an error: exhaustion is reported as a value and logged, the
    /// caller decides whether that fails the surrounding segment.
    pub async fn run(
        &self,
        mut spec: TranscodeSpec,
        validator: Option<(&dyn OutputValidator, &ValidationContext)>,
    ) -> TranscodeOutcome {
        let budget = self.retry_budget.max(1);
        let mut last_error = String::new();
        for attempt in 1..=budget {
            match self.attempt(&spec, validator).await {
                Ok(AttemptSuccess::Done) => {
                    return TranscodeOutcome::Completed { attempts: attempt };
                }
                Ok(AttemptSuccess::AlreadyExists) => {
                    info!(output = %spec.output.display(), "output file already exists");
                    return TranscodeOutcome::AlreadyExists;
                }
                Err(failure) => {
                    last_error = failure.to_string();
                    self.handle_failure(&mut spec, failure, attempt, budget).await;
                }
            }
        }
        error!(
            attempts = budget,
            output = %spec.output.display(),
            error = %last_error,
            "transcode retries exhausted"
        );
        TranscodeOutcome::Exhausted {
            attempts: budget,
            last_error,
        }
    }

    async fn attempt(
        &self,
        spec: &TranscodeSpec,
        validator: Option<(&dyn OutputValidator, &ValidationContext)>,
    ) -> Result<AttemptSuccess, AttemptFailure> {
        let args = self.build_args(spec);
        let outcome = self
            .runner
            .run(&self.ffmpeg, &args, Some(self.timeout))
            .await
            .map_err(|err| AttemptFailure::Process(err.to_string()))?;
        let output = match outcome {
            RunOutcome::TimedOut => return Err(AttemptFailure::Timeout),
            RunOutcome::Completed(output) => output,
        };
        if !output.success() {
            let stderr = output.stderr.trim_end();
            if stderr.ends_with("already exists. Exiting.") {
                return Ok(AttemptSuccess::AlreadyExists);
            }
            if self.http_error.is_match(stderr) {
                return Err(AttemptFailure::Transient(last_line(stderr)));
            }
            return Err(AttemptFailure::Process(format!(
                "exit code {:?}: {}",
                output.exit_code,
                last_line(stderr)
            )));
        }
        if let Some((validator, ctx)) = validator {
            validator.validate(&spec.output, ctx).await?;
        }
        Ok(AttemptSuccess::Done)
    }

    async fn handle_failure(
        &self,
        spec: &mut TranscodeSpec,
        failure: AttemptFailure,
        attempt: u32,
        budget: u32,
    ) {
        let final_attempt = attempt == budget;
        match failure {
            AttemptFailure::Transient(detail) => {
                warn!(attempt, error = %detail, "transient http failure, retrying");
                self.remove_partial(&spec.output).await;
            }
            AttemptFailure::Process(detail) => {
                error!(attempt, error = %detail, "ffmpeg failed, retrying");
                self.remove_partial(&spec.output).await;
            }
            AttemptFailure::Timeout => {
                warn!(attempt, timeout = ?self.timeout, "ffmpeg timed out, retrying");
                self.remove_partial(&spec.output).await;
            }
            AttemptFailure::Validation(ValidationError::DurationMismatch { expected, actual }) => {
                if !final_attempt {
                    self.remove_partial(&spec.output).await;
                }
                // Stretch the requested duration by the observed shortfall
                // so the next attempt lands on the expected length.
                let diff = expected - actual;
                if adjust_duration_arg(&mut spec.input_args, diff)
                    || adjust_duration_arg(&mut spec.output_args, diff)
                {
                    warn!(attempt, expected, actual, "duration drift, adjusting -t and retrying");
                } else {
                    warn!(attempt, expected, actual, "duration drift but no -t argument to adjust");
                }
            }
            AttemptFailure::Validation(ValidationError::Unopenable { detail }) => {
                // Unopenable output is corrupt; never resume from it.
                self.remove_partial(&spec.output).await;
                info!(attempt, error = %detail, "output unopenable, retrying");
            }
            AttemptFailure::Validation(ValidationError::Mismatch { detail }) => {
                if !final_attempt {
                    self.remove_partial(&spec.output).await;
                }
                info!(attempt, error = %detail, "output did not validate, retrying");
            }
        }
    }

    fn build_args(&self, spec: &TranscodeSpec) -> Vec<String> {
        let mut args = spec.input_args.clone();
        for input in &spec.inputs {
            args.push("-i".to_string());
            args.push(input.clone());
        }
        args.extend(spec.output_args.iter().cloned());
        args.push(spec.output.to_string_lossy().into_owned());
        args.push("-loglevel".to_string());
        args.push(self.log_level.clone());
        args
    }

    async fn remove_partial(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove partial output");
            }
        }
    }
}

/// Adds `diff` to the value following `-t`, returning whether the argument
/// list contained one.
fn adjust_duration_arg(args: &mut [String], diff: f64) -> bool {
    let Some(position) = args.iter().position(|arg| arg == "-t") else {
        return false;
    };
    let Some(value) = args.get(position + 1) else {
        return false;
    };
    let Ok(current) = value.parse::<f64>() else {
        return false;
    };
    args[position + 1] = (current + diff).to_string();
    true
}

fn last_line(stderr: &str) -> String {
    stderr.lines().last().unwrap_or_default().trim().to_string()
}
