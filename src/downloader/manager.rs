use crate::downloader::events::{EventKind, EventSink};
use crate::downloader::{CancelSignal, DownloadOptions, ExecutionOutcome, Job, JobExecutor, JobId, JobProgress, JobState};
use crate::errors::{AppError, Result};
use crate::security::InputValidator;
use crate::utils::{generate_download_id, remove_artifact};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};

const LOG_TAIL_LINES: usize = 20;
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Registry of all known jobs. Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct JobRegistry {
    shared: Arc<Shared>,
    executor: Arc<dyn JobExecutor>,
    admission: Option<Arc<Semaphore>>,
}

struct Shared {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    events: EventSink,
}

struct JobEntry {
    /// The job itself. Waiters are only woken by state changes.
    job: watch::Sender<Job>,
    cancel: watch::Sender<bool>,
}

/// Handle given to an executor for reporting on the one job it runs.
#[derive(Clone)]
pub struct JobReporter {
    job_id: JobId,
    shared: Arc<Shared>,
}

/// Follows one job from the moment it was obtained. The last snapshot stays
/// readable after the retention sweep has dropped the job from the registry.
pub struct JobWatcher {
    receiver: watch::Receiver<Job>,
}

impl JobWatcher {
    /// Suspends until the job is finished and returns its final snapshot.
    pub async fn finished(mut self) -> Job {
        let finished = self
            .receiver
            .wait_for(|job| job.state.is_terminal())
            .await
            .map(|job| job.clone());
        finished.unwrap_or_else(|_| self.receiver.borrow().clone())
    }
}

impl JobRegistry {
    /// `max_concurrent` of 0 admits every job immediately.
    pub fn new(executor: Arc<dyn JobExecutor>, events: EventSink, max_concurrent: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                events,
            }),
            executor,
            admission: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.shared.events
    }

    /// Validates the request, registers a `Queued` job and schedules it.
    /// Nothing is registered when validation fails.
    pub async fn submit(&self, url: &str, options: DownloadOptions) -> Result<JobId> {
        let validator = InputValidator::new();
        validator.validate_url(url)?;
        validator.validate_destination_dir(&options.destination)?;
        if let Some(section) = &options.section {
            for value in [&section.start, &section.end].into_iter().flatten() {
                validator.validate_timestamp(value)?;
            }
        }

        let (cancel_tx, cancel) = CancelSignal::channel();
        let job_id = {
            let mut jobs = self.shared.jobs.lock().await;
            let mut job_id = generate_download_id();
            while jobs.contains_key(&job_id) {
                job_id = generate_download_id();
            }

            let job = Job::new(job_id.clone(), url.trim().to_string(), options);
            let (job_tx, _) = watch::channel(job);
            jobs.insert(job_id.clone(), JobEntry { job: job_tx, cancel: cancel_tx });
            self.shared.events.publish(&job_id, EventKind::StateChanged { state: JobState::Queued, error: None });
            job_id
        };

        log::info!("[REGISTRY] Queued job {} for {}", job_id, url.trim());

        let registry = self.clone();
        let worker_id = job_id.clone();
        tokio::spawn(async move {
            registry.run_job(worker_id, cancel).await;
        });

        Ok(job_id)
    }

    /// Requests cancellation. Returns `Ok(true)` for the call that started it and
    /// `Ok(false)` when the job is already cancelling or finished.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let jobs = self.shared.jobs.lock().await;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        if !self.shared.transition(job_id, entry, JobState::Cancelling, None) {
            return Ok(false);
        }
        entry.cancel.send_replace(true);
        log::info!("[REGISTRY] Cancellation requested for job {}", job_id);
        Ok(true)
    }

    /// Point-in-time snapshot of every job, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let jobs = self.shared.jobs.lock().await;
        let mut snapshot: Vec<Job> = jobs.values().map(|entry| entry.job.borrow().clone()).collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let jobs = self.shared.jobs.lock().await;
        jobs.get(job_id).map(|entry| entry.job.borrow().clone())
    }

    pub async fn len(&self) -> usize {
        self.shared.jobs.lock().await.len()
    }

    /// Forgets a finished job.
    pub async fn remove(&self, job_id: &str) -> Result<Job> {
        let mut jobs = self.shared.jobs.lock().await;
        let state = jobs
            .get(job_id)
            .map(|entry| entry.job.borrow().state)
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        if !state.is_terminal() {
            return Err(AppError::InvalidState(format!("job {} is still {}", job_id, state)));
        }

        let entry = jobs
            .remove(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;
        let job = entry.job.borrow().clone();
        Ok(job)
    }

    pub async fn watch(&self, job_id: &str) -> Result<JobWatcher> {
        let jobs = self.shared.jobs.lock().await;
        jobs.get(job_id)
            .map(|entry| JobWatcher {
                receiver: entry.job.subscribe(),
            })
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
    }

    /// Suspends until the job is finished and returns its final snapshot.
    pub async fn wait(&self, job_id: &str) -> Result<Job> {
        Ok(self.watch(job_id).await?.finished().await)
    }

    /// Cancels everything still active and waits until all of it has settled.
    pub async fn shutdown(&self) -> Result<()> {
        let active: Vec<JobId> = {
            let jobs = self.shared.jobs.lock().await;
            jobs.iter()
                .filter(|(_, entry)| !entry.job.borrow().state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };

        if !active.is_empty() {
            log::info!("[REGISTRY] Shutting down {} active job(s)", active.len());
        }

        for job_id in &active {
            match self.cancel(job_id).await {
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for job_id in &active {
            match self.wait(job_id).await {
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Periodically drops finished jobs older than `retention`. The task ends on
    /// its own once the registry is gone.
    pub fn spawn_retention_sweeper(&self, retention: Duration) -> tokio::task::JoinHandle<()> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = (retention / 2).clamp(Duration::from_millis(10), MAX_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };

                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
                let mut jobs = shared.jobs.lock().await;
                let before = jobs.len();
                jobs.retain(|_, entry| {
                    let job = entry.job.borrow();
                    !(job.state.is_terminal() && job.finished_at.map_or(false, |at| at <= cutoff))
                });
                let swept = before - jobs.len();
                if swept > 0 {
                    log::debug!("[REGISTRY] Retention sweep removed {} job(s)", swept);
                }
            }
        })
    }

    async fn run_job(&self, job_id: JobId, mut cancel: CancelSignal) {
        let _permit = match &self.admission {
            Some(semaphore) => {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                }
            }
            None => None,
        };

        let Some(job) = self.shared.begin(&job_id).await else {
            // Cancelled while queued; nothing was started so nothing to clean up.
            self.shared.finish(&job_id, ExecutionOutcome::Cancelled).await;
            return;
        };

        let reporter = JobReporter {
            job_id: job_id.clone(),
            shared: self.shared.clone(),
        };
        let outcome = self.executor.execute(&job, &reporter, cancel).await;
        self.shared.finish(&job_id, outcome).await;
    }
}

impl Shared {
    /// Applies a state change if the state machine allows it. Must be called
    /// with the jobs lock held so events leave in the same order as changes.
    fn transition(&self, job_id: &str, entry: &JobEntry, next: JobState, error: Option<String>) -> bool {
        let applied = entry.job.send_if_modified(|job| {
            if !job.state.can_transition_to(next) {
                return false;
            }
            job.state = next;
            match next {
                JobState::Running => job.started_at = Some(chrono::Utc::now()),
                state if state.is_terminal() => {
                    job.finished_at = Some(chrono::Utc::now());
                    job.error = error.clone();
                }
                _ => {}
            }
            true
        });

        if applied {
            self.events.publish(job_id, EventKind::StateChanged { state: next, error });
        } else {
            log::debug!("[REGISTRY] Ignored transition of job {} to {}", job_id, next);
        }
        applied
    }

    /// `Queued -> Running`. `None` when the job was cancelled before admission.
    async fn begin(&self, job_id: &str) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(job_id)?;
        if self.transition(job_id, entry, JobState::Running, None) {
            log::info!("[REGISTRY] Starting job {}", job_id);
            Some(entry.job.borrow().clone())
        } else {
            None
        }
    }

    /// Moves the job to its terminal state once the executor has returned.
    async fn finish(&self, job_id: &str, outcome: ExecutionOutcome) {
        let leftovers: Vec<PathBuf> = {
            let jobs = self.jobs.lock().await;
            match jobs.get(job_id) {
                Some(entry) => entry.job.borrow().temp_artifacts.iter().cloned().collect(),
                None => return,
            }
        };

        // Executors clean up after themselves; this only catches what they missed.
        for path in &leftovers {
            if let Err(e) = remove_artifact(path).await {
                log::warn!("[REGISTRY] Could not remove {:?} for job {}: {}", path, job_id, e);
            }
        }

        let jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get(job_id) else {
            return;
        };
        entry.job.send_if_modified(|job| {
            job.temp_artifacts.clear();
            false
        });

        let cancelling = entry.job.borrow().state == JobState::Cancelling;
        match outcome {
            _ if cancelling => {
                self.transition(job_id, entry, JobState::Cancelled, None);
            }
            ExecutionOutcome::Completed { output_file } => {
                entry.job.send_if_modified(|job| {
                    job.output_file = output_file;
                    job.progress.percent = Some(100.0);
                    job.progress.eta_seconds = Some(0);
                    false
                });
                self.transition(job_id, entry, JobState::Completed, None);
            }
            ExecutionOutcome::Failed(error) => {
                log::error!("[REGISTRY] Job {} failed: {}", job_id, error);
                self.transition(job_id, entry, JobState::Failed, Some(error.to_string()));
            }
            ExecutionOutcome::Cancelled => {
                // Executors only give up on their own when asked to, so this is a
                // job that never got as far as Cancelling; treat it as a failure.
                self.transition(job_id, entry, JobState::Failed, Some(AppError::Cancelled.to_string()));
            }
        }
    }

    async fn update<F>(&self, job_id: &str, apply: F) -> Option<()>
    where
        F: FnOnce(&mut Job, &EventSink),
    {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(job_id)?;
        entry.job.send_if_modified(|job| {
            apply(job, &self.events);
            false
        });
        Some(())
    }
}

impl JobReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn progress(&self, progress: JobProgress) {
        let job_id = self.job_id.clone();
        self.shared
            .update(&self.job_id, move |job, events| {
                job.progress = progress.clone();
                events.publish(&job_id, EventKind::Progress(progress));
            })
            .await;
    }

    /// One line of tool output, kept in the job's log tail.
    pub async fn log(&self, line: impl Into<String>) {
        let line = line.into();
        let job_id = self.job_id.clone();
        self.shared
            .update(&self.job_id, move |job, events| {
                job.log_tail.push(line.clone());
                if job.log_tail.len() > LOG_TAIL_LINES {
                    let excess = job.log_tail.len() - LOG_TAIL_LINES;
                    job.log_tail.drain(..excess);
                }
                events.publish(&job_id, EventKind::Log(line));
            })
            .await;
    }

    pub async fn track_artifact(&self, path: &Path) {
        let path = path.to_path_buf();
        self.shared
            .update(&self.job_id, move |job, _| {
                job.temp_artifacts.insert(path);
            })
            .await;
    }

    pub async fn untrack_artifact(&self, path: &Path) {
        self.shared
            .update(&self.job_id, |job, _| {
                job.temp_artifacts.remove(path);
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodingConfig;
    use crate::downloader::AuthSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Waits for cancellation, or finishes after `work` when not cancelled.
    struct FakeExecutor {
        work: Duration,
        fail: bool,
        running: AtomicUsize,
        peak: AtomicUsize,
        cancellations: AtomicUsize,
    }

    impl FakeExecutor {
        fn new(work: Duration) -> Self {
            Self {
                work,
                fail: false,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                cancellations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobExecutor for FakeExecutor {
        async fn execute(&self, job: &Job, reporter: &JobReporter, mut cancel: CancelSignal) -> ExecutionOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let artifact = job.options.destination.join(format!("{}.part", job.id));
            std::fs::write(&artifact, b"partial").unwrap();
            reporter.track_artifact(&artifact).await;
            reporter
                .progress(JobProgress {
                    percent: Some(50.0),
                    ..JobProgress::default()
                })
                .await;

            let outcome = tokio::select! {
                _ = tokio::time::sleep(self.work) => {
                    if self.fail {
                        std::fs::remove_file(&artifact).unwrap();
                        reporter.untrack_artifact(&artifact).await;
                        ExecutionOutcome::Failed(AppError::ProcessFailure {
                            binary: "fake".to_string(),
                            code: Some(1),
                            stderr_tail: "boom".to_string(),
                        })
                    } else {
                        let output = job.options.destination.join("done.mp4");
                        std::fs::rename(&artifact, &output).unwrap();
                        reporter.untrack_artifact(&artifact).await;
                        ExecutionOutcome::Completed { output_file: Some(output) }
                    }
                }
                _ = cancel.cancelled() => {
                    self.cancellations.fetch_add(1, Ordering::SeqCst);
                    std::fs::remove_file(&artifact).unwrap();
                    reporter.untrack_artifact(&artifact).await;
                    ExecutionOutcome::Cancelled
                }
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn options(dir: &Path) -> DownloadOptions {
        DownloadOptions::from_preferences(&EncodingConfig::default(), dir.to_path_buf(), AuthSource::None)
    }

    fn registry(executor: Arc<FakeExecutor>, max_concurrent: usize) -> JobRegistry {
        JobRegistry::new(executor, EventSink::default(), max_concurrent)
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(Arc::new(FakeExecutor::new(Duration::from_millis(20))), 2);
        let mut events = registry.events().subscribe();

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        let job = registry.wait(&id).await.unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert!(job.temp_artifacts.is_empty());
        assert_eq!(job.output_file, Some(dir.path().join("done.mp4")));
        assert!(job.started_at.is_some() && job.finished_at.is_some());

        let mut states = Vec::new();
        while let Some(event) = events.try_recv() {
            if let EventKind::StateChanged { state, .. } = event.kind {
                states.push(state);
            }
        }
        assert_eq!(states, vec![JobState::Queued, JobState::Running, JobState::Completed]);
    }

    #[tokio::test]
    async fn invalid_submissions_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(Arc::new(FakeExecutor::new(Duration::from_millis(1))), 1);

        let bad_dest = options(&dir.path().join("missing"));
        assert!(matches!(
            registry.submit("https://example.com/v", bad_dest).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.submit("", options(dir.path())).await,
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn cancel_running_job_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(Duration::from_secs(30)));
        let registry = registry(executor.clone(), 1);

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        while registry.get(&id).await.unwrap().state != JobState::Running {
            tokio::task::yield_now().await;
        }

        assert!(registry.cancel(&id).await.unwrap());
        let job = registry.wait(&id).await.unwrap();

        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.temp_artifacts.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!registry.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_cancels_terminate_once() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(Duration::from_secs(30)));
        let registry = registry(executor.clone(), 0);

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { registry.cancel(&id).await.unwrap() }));
        }
        let mut initiated = 0;
        for handle in handles {
            if handle.await.unwrap() {
                initiated += 1;
            }
        }

        assert_eq!(initiated, 1);
        assert_eq!(registry.wait(&id).await.unwrap().state, JobState::Cancelled);
        assert!(executor.cancellations.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn cancel_while_queued_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(Duration::from_secs(30)));
        let registry = registry(executor.clone(), 1);

        let first = registry.submit("https://example.com/1", options(dir.path())).await.unwrap();
        let second = registry.submit("https://example.com/2", options(dir.path())).await.unwrap();
        assert_eq!(registry.get(&second).await.unwrap().state, JobState::Queued);

        assert!(registry.cancel(&second).await.unwrap());
        let job = registry.wait(&second).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.started_at.is_none());

        registry.shutdown().await.unwrap();
        assert_eq!(registry.get(&first).await.unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn admission_limit_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(Duration::from_millis(30)));
        let registry = registry(executor.clone(), 2);

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(registry.submit(&format!("https://example.com/{}", i), options(dir.path())).await.unwrap());
        }
        for id in &ids {
            // Each fake renames into the same output name; only states matter here.
            let job = registry.wait(id).await.unwrap();
            assert!(job.state.is_terminal());
        }
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failure_keeps_error_and_remove_requires_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = FakeExecutor::new(Duration::from_millis(10));
        executor.fail = true;
        let registry = registry(Arc::new(executor), 1);

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        let job = registry.wait(&id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("boom"));

        registry.remove(&id).await.unwrap();
        assert!(matches!(registry.remove(&id).await, Err(AppError::NotFound(_))));
        assert!(matches!(registry.cancel(&id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_rejects_active_job() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(Arc::new(FakeExecutor::new(Duration::from_secs(30))), 1);

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        assert!(matches!(registry.remove(&id).await, Err(AppError::InvalidState(_))));
        registry.shutdown().await.unwrap();
        assert!(registry.remove(&id).await.is_ok());
    }

    #[tokio::test]
    async fn retention_sweeper_drops_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(Arc::new(FakeExecutor::new(Duration::from_millis(1))), 1);
        let sweeper = registry.spawn_retention_sweeper(Duration::from_millis(20));

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        registry.wait(&id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(&id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sweeper.abort();
    }

    #[tokio::test]
    async fn watcher_keeps_the_result_after_the_job_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(Arc::new(FakeExecutor::new(Duration::from_millis(100))), 0);
        let sweeper = registry.spawn_retention_sweeper(Duration::from_millis(20));

        let id = registry.submit("https://example.com/v", options(dir.path())).await.unwrap();
        let watcher = registry.watch(&id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(&id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(registry.wait(&id).await, Err(AppError::NotFound(_))));
        let job = watcher.finished().await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output_file, Some(dir.path().join("done.mp4")));
        sweeper.abort();
    }
}
