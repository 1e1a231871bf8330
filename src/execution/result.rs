//! Job Results
//!
//! When a job completes, two snapshots are written under
//! `<result_dir>/<job_id>/`:
//!
//! - `summary.json`: status, result value, timestamps, error digest
//! - `detail.json`: the summary plus per-testcase outcomes
//!
//! Both stay readable after the job has left the live registry.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

const SUMMARY_FILE: &str = "summary.json";
const DETAIL_FILE: &str = "detail.json";

/// How a job ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionStatus {
    #[default]
    Normal,
    Terminated,
    Abnormal,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Normal => write!(f, "Normal"),
            CompletionStatus::Terminated => write!(f, "Terminated"),
            CompletionStatus::Abnormal => write!(f, "Abnormal"),
        }
    }
}

/// Running verdict of a job. The first non-normal status recorded wins.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub status: CompletionStatus,
    pub termination_code: Option<i64>,
    pub reason: Option<String>,
}

impl JobOutcome {
    /// Records a verdict; returns false if an earlier one already stands.
    pub fn escalate(
        &mut self,
        status: CompletionStatus,
        termination_code: Option<i64>,
        reason: impl Into<String>,
    ) -> bool {
        if self.status != CompletionStatus::Normal || status == CompletionStatus::Normal {
            return false;
        }
        self.status = status;
        self.termination_code = termination_code;
        self.reason = Some(reason.into());
        true
    }
}

/// One entry of a job's log digest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl JobLogEntry {
    pub fn new(level: log::Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == log::Level::Error.to_string()
    }
}

/// Pass/fail tally of one named testcase.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestcaseOutcome {
    pub name: String,
    pub passes: u32,
    pub fails: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl TestcaseOutcome {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, passed: bool, message: Option<String>) {
        if passed {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
        if message.is_some() {
            self.last_message = message;
        }
    }
}

/// Result summary of a completed job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub job_id: u64,
    pub job_name: String,
    pub document: String,
    pub start_function: Option<String>,
    pub status: CompletionStatus,
    pub termination_code: Option<i64>,
    pub reason: Option<String>,
    pub result: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub errors: Vec<JobLogEntry>,
}

impl JobSummary {
    /// Wall-clock run time in milliseconds, if the job ever started.
    pub fn duration_ms(&self) -> Option<i64> {
        self.started_at
            .map(|start| (self.ended_at - start).num_milliseconds())
    }
}

/// Summary plus the structured testcase outcome list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobDetail {
    pub summary: JobSummary,
    pub testcases: Vec<TestcaseOutcome>,
}

/// Directory of persisted job results.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_dir(&self, job_id: u64) -> PathBuf {
        self.dir.join(job_id.to_string())
    }

    /// Writes both snapshots of a completed job.
    pub fn save(&self, detail: &JobDetail) -> Result<()> {
        let dir = self.job_dir(detail.summary.job_id);
        fs::create_dir_all(&dir)?;

        fs::write(
            dir.join(SUMMARY_FILE),
            serde_json::to_string_pretty(&detail.summary)?,
        )?;
        fs::write(dir.join(DETAIL_FILE), serde_json::to_string_pretty(detail)?)?;

        info!("Saved results of job {} to {}", detail.summary.job_id, dir.display());
        Ok(())
    }

    pub fn load_summary(&self, job_id: u64) -> Result<JobSummary> {
        self.read(job_id, SUMMARY_FILE)
    }

    pub fn load_detail(&self, job_id: u64) -> Result<JobDetail> {
        self.read(job_id, DETAIL_FILE)
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, job_id: u64, file: &str) -> Result<T> {
        let path = self.job_dir(job_id).join(file);
        if !path.exists() {
            return Err(EngineError::ResultNotFound(job_id));
        }
        debug!("Loading job result from {}", path.display());
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Removes the snapshots of one job.
    pub fn delete(&self, job_id: u64) -> Result<()> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!("Deleted results of job {}", job_id);
        }
        Ok(())
    }
}
