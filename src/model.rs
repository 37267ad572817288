use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AutoCompletionConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChapterJobStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterJob {
    pub chapter_number: u32,
    pub status: ChapterJobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub quality_score: Option<f64>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub recovery_attempts: u32,
}

impl ChapterJob {
    pub fn pending(chapter_number: u32) -> Self {
        Self {
            chapter_number,
            status: ChapterJobStatus::Pending,
            start_time: None,
            completion_time: None,
            retry_count: 0,
            quality_score: None,
            failure_reason: None,
            recovery_attempts: 0,
        }
    }

    /// Back to the queue after a successful recovery or a restore that removed the chapter.
    pub fn reset_to_pending(&mut self) {
        self.status = ChapterJobStatus::Pending;
        self.retry_count = 0;
        self.start_time = None;
        self.completion_time = None;
        self.quality_score = None;
    }
}

/// Run-level state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    NotStarted,
    Initializing,
    Generating,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (NotStarted, Initializing) => true,
            (Initializing, Generating) | (Initializing, Failed) => true,
            (Generating, Paused)
            | (Generating, Completed)
            | (Generating, Failed)
            | (Generating, Cancelled) => true,
            (Paused, Generating) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Initializing => "INITIALIZING",
            Self::Generating => "GENERATING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseDetails {
    pub chapter_number: Option<u32>,
    pub reason: String,
    pub paused_at: DateTime<Utc>,
}

/// `state/run.json`: the orchestrator's exclusively owned queue plus run outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    pub config: AutoCompletionConfig,
    pub jobs: Vec<ChapterJob>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn job(&self, chapter_number: u32) -> Option<&ChapterJob> {
        self.jobs.iter().find(|j| j.chapter_number == chapter_number)
    }

    pub fn job_mut(&mut self, chapter_number: u32) -> Option<&mut ChapterJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.chapter_number == chapter_number)
    }

    /// Lowest-numbered pending job.
    pub fn next_pending(&self) -> Option<u32> {
        self.jobs
            .iter()
            .filter(|j| j.status == ChapterJobStatus::Pending)
            .map(|j| j.chapter_number)
            .min()
    }

    pub fn count(&self, status: ChapterJobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Result payload of a run (also what `status` reports).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    pub completed_with_failures: bool,
    pub chapters_on_disk: u32,
    pub chapters_completed: usize,
    pub chapters_failed: usize,
    pub chapters_pending: usize,
    pub total_words: u64,
    pub progress_percent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "run: {}", self.run_id)?;
        if self.completed_with_failures {
            writeln!(f, "state: {} (with failures)", self.state)?;
        } else {
            writeln!(f, "state: {}", self.state)?;
        }
        writeln!(
            f,
            "progress: {}% ({} chapters on disk, {} words)",
            self.progress_percent, self.chapters_on_disk, self.total_words
        )?;
        writeln!(
            f,
            "jobs: {} completed, {} failed, {} pending",
            self.chapters_completed, self.chapters_failed, self.chapters_pending
        )?;
        if let Some(reason) = &self.stop_reason {
            writeln!(f, "stop reason: {reason}")?;
        }
        if let Some(pause) = &self.pause {
            match pause.chapter_number {
                Some(chapter) => writeln!(f, "paused at chapter {chapter}: {}", pause.reason)?,
                None => writeln!(f, "paused: {}", pause.reason)?,
            }
        }
        if let Some(error) = &self.error {
            writeln!(f, "error: {error}")?;
        }
        Ok(())
    }
}

/// Final outcome of one chapter's quality-gated generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterOutcome {
    Completed {
        word_count: u64,
        quality_score: f64,
        attempt: u32,
        generation_time_secs: f64,
    },
    /// Recovery succeeded; the job is pending again.
    Recovered,
    Failed {
        reason: String,
    },
}
