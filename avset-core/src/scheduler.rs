//! Batch scheduling: reads a segment list, filters out work that is
//! already done or permanently failed, and fans the rest out to a
//! bounded worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::download::{SegmentDownloader, SegmentRequest};
use crate::ledger::{FailureLedger, FailureRecord, LedgerError};

pub const FAILURE_LEDGER_FILENAME: &str = "failures.csv";

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("failed to read segment list {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to fetch segment list {url}: {detail}")]
    Fetch { url: String, detail: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Tally of one batch run over a subset list.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub subset: String,
    pub scheduled: usize,
    pub skipped_complete: usize,
    pub skipped_failed: usize,
    pub skipped_malformed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct JobScheduler {
    downloader: Arc<SegmentDownloader>,
    num_workers: usize,
}

impl JobScheduler {
    pub fn new(downloader: Arc<SegmentDownloader>, num_workers: usize) -> Self {
        Self {
            downloader,
            num_workers: num_workers.max(1),
        }
    }

    /// Downloads every pending segment of one subset list. The list may be
    /// a local path or an HTTP(S) URL; remote lists are fetched into the
    /// dataset directory once and reused on later runs.
    pub async fn run_subset(
        &self,
        subset_source: &str,
        dataset_dir: &Path,
    ) -> ScheduleResult<BatchReport> {
        let started_at = Utc::now();
        let subset_path = if is_url(subset_source) {
            fetch_subset_list(subset_source, dataset_dir).await?
        } else {
            PathBuf::from(subset_source)
        };
        let subset = subset_name(&subset_path);

        let data_dir = dataset_dir.join(&subset);
        for sub in ["audio", "video"] {
            let dir = data_dir.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| ScheduleError::Io { source, path: dir })?;
        }

        let mut ledger = FailureLedger::load(dataset_dir.join(FAILURE_LEDGER_FILENAME))?;
        info!(subset = %subset, known_failures = ledger.len(), "loaded failure ledger");

        let contents = tokio::fs::read_to_string(&subset_path)
            .await
            .map_err(|source| ScheduleError::Io {
                source,
                path: subset_path.clone(),
            })?;
        let (requests, skipped_malformed) = parse_segment_list(&contents);

        let mut pending = Vec::new();
        let mut skipped_complete = 0usize;
        let mut skipped_failed = 0usize;
        for request in requests {
            if self.downloader.is_complete(&data_dir, &request) {
                skipped_complete += 1;
                continue;
            }
            if ledger.contains(&request.id) {
                skipped_failed += 1;
                continue;
            }
            pending.push(request);
        }
        let scheduled = pending.len();
        info!(
            subset = %subset,
            scheduled,
            skipped_complete,
            skipped_failed,
            workers = self.num_workers,
            "starting download jobs"
        );

        let results: Vec<(SegmentRequest, Result<(), String>)> = stream::iter(pending)
            .map(|request| {
                let downloader = Arc::clone(&self.downloader);
                let data_dir = data_dir.clone();
                async move {
                    let result = downloader
                        .download(&data_dir, &request)
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_string());
                    (request, result)
                }
            })
            .buffer_unordered(self.num_workers)
            .collect()
            .await;

        let mut succeeded = 0usize;
        let mut failures = Vec::new();
        for (request, result) in results {
            match result {
                Ok(()) => succeeded += 1,
                Err(reason) => {
                    warn!(id = %request.id, error = %reason, "segment failed");
                    failures.push(FailureRecord {
                        id: request.id,
                        reason,
                    });
                }
            }
        }
        // The ledger stays read-only while workers run; terminal failures
        // of this batch land in one append after the pool drains.
        ledger.append(&failures)?;

        let report = BatchReport {
            subset,
            scheduled,
            skipped_complete,
            skipped_failed,
            skipped_malformed,
            succeeded,
            failed: failures.len(),
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            subset = %report.subset,
            succeeded = report.succeeded,
            failed = report.failed,
            "finished download jobs"
        );
        Ok(report)
    }
}

/// Parses the whole list, returning the well-formed requests in file order
/// and the count of malformed rows. Comment rows are neither.
pub fn parse_segment_list(contents: &str) -> (Vec<SegmentRequest>, usize) {
    let mut requests = Vec::new();
    let mut malformed = 0usize;
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_segment_row(line) {
            Some(request) => requests.push(request),
            None => {
                warn!(line = line_number + 1, "skipping malformed segment row");
                malformed += 1;
            }
        }
    }
    (requests, malformed)
}

/// One row: `identifier, start_seconds, end_seconds, ...` with any extra
/// columns ignored.
pub fn parse_segment_row(line: &str) -> Option<SegmentRequest> {
    let mut fields = line.split(',');
    let id = fields.next()?.trim();
    let start: f64 = fields.next()?.trim().parse().ok()?;
    let end: f64 = fields.next()?.trim().parse().ok()?;
    if id.is_empty() || !start.is_finite() || !end.is_finite() || end < start {
        return None;
    }
    Some(SegmentRequest {
        id: id.to_string(),
        start,
        end,
    })
}

pub fn is_url(source: &str) -> bool {
    Url::parse(source)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn subset_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segments".to_string())
}

async fn fetch_subset_list(url: &str, dataset_dir: &Path) -> ScheduleResult<PathBuf> {
    let filename = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.last().map(|s| s.to_string()))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "segments.csv".to_string());
    let target = dataset_dir.join(filename);
    if target.exists() {
        return Ok(target);
    }
    tokio::fs::create_dir_all(dataset_dir)
        .await
        .map_err(|source| ScheduleError::Io {
            source,
            path: dataset_dir.to_path_buf(),
        })?;
    info!(url, target = %target.display(), "fetching segment list");
    let fetch = |detail: String| ScheduleError::Fetch {
        url: url.to_string(),
        detail,
    };
    let response = reqwest::get(url)
        .await
        .map_err(|err| fetch(err.to_string()))?
        .error_for_status()
        .map_err(|err| fetch(err.to_string()))?;
    let body = response.text().await.map_err(|err| fetch(err.to_string()))?;
    tokio::fs::write(&target, body)
        .await
        .map_err(|source| ScheduleError::Io {
            source,
            path: target.clone(),
        })?;
    Ok(target)
}
