pub mod args;
pub mod events;
pub mod manager;
pub mod process;
pub mod progress;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::watch;
use crate::config::{EncodingConfig, MediaKind, QualityPreset, VideoCodec};
use crate::errors::AppError;
use self::manager::JobReporter;

pub type JobId = String;

/// Carries out a job once the registry has admitted it.
///
/// Implementations report through `reporter` and must watch `cancel`: once it
/// fires they stop their subprocess, delete every artifact they created and
/// return [`ExecutionOutcome::Cancelled`]. The same cleanup applies before
/// returning [`ExecutionOutcome::Failed`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, reporter: &JobReporter, cancel: CancelSignal) -> ExecutionOutcome;
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed { output_file: Option<PathBuf> },
    Failed(AppError),
    Cancelled,
}

/// Receiving side of a job's cancellation request.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn channel() -> (watch::Sender<bool>, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelSignal(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation has been requested; never resolves otherwise.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One requested download/conversion unit. Values handed out by the registry are
/// snapshots; mutating them has no effect on the job itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub options: DownloadOptions,
    pub state: JobState,
    pub progress: JobProgress,
    pub temp_artifacts: BTreeSet<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub error: Option<String>,
    pub log_tail: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum JobPhase {
    #[default]
    Downloading,
    Encoding,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub phase: JobPhase,
    pub percent: Option<f32>,
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
}

/// Immutable snapshot of everything the user chose at submission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadOptions {
    pub media: MediaKind,
    pub container: Option<String>,
    pub codec: VideoCodec,
    pub preset: QualityPreset,
    pub destination: PathBuf,
    pub overwrite: bool,
    pub threads: u32,
    pub split_download: bool,
    pub fragments: u32,
    pub section: Option<TimeRange>,
    pub auth: AuthSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    #[default]
    None,
    /// Cookies from the encrypted credential store.
    SessionCookies,
    Browser(String),
    CookieFile(PathBuf),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Failed | JobState::Completed)
    }

    /// The only transitions a job may take.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Queued, Running)
                | (Queued, Cancelling)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
        };
        f.write_str(text)
    }
}

impl DownloadOptions {
    pub fn from_preferences(prefs: &EncodingConfig, destination: PathBuf, auth: AuthSource) -> Self {
        Self {
            media: prefs.media,
            container: prefs.container.clone(),
            codec: prefs.codec,
            preset: prefs.preset,
            destination,
            overwrite: prefs.overwrite,
            threads: prefs.threads.max(1),
            split_download: prefs.split_download,
            fragments: prefs.fragments.max(1),
            section: None,
            auth,
        }
    }

    /// Whether a separate encoder pass follows the download.
    pub fn needs_encoding(&self) -> bool {
        self.media == MediaKind::Video && !self.codec.is_passthrough()
    }
}

impl Job {
    pub(crate) fn new(id: JobId, source_url: String, options: DownloadOptions) -> Self {
        Self {
            id,
            source_url,
            options,
            state: JobState::Queued,
            progress: JobProgress::default(),
            temp_artifacts: BTreeSet::new(),
            output_file: None,
            error: None,
            log_tail: Vec::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
