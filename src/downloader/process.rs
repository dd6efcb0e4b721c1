use crate::downloader::args::{build_extractor_args, ExtractorContext};
use crate::downloader::manager::JobReporter;
use crate::downloader::progress::{encoder_percent, parse_encoder_duration, parse_encoder_time, parse_line, ParsedLine};
use crate::downloader::{AuthSource, CancelSignal, ExecutionOutcome, Job, JobExecutor, JobPhase, JobProgress};
use crate::errors::{AppError, Result};
use crate::processing;
use crate::security::CookieStore;
use crate::utils::{claim_unique_path, remove_artifact};
use async_trait::async_trait;
use futures::Stream;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);
const STDERR_TAIL_LINES: usize = 20;
const LINE_BUFFER: usize = 1024;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const STAGING_PREFIX: &str = ".vdl-";

type Tail = Arc<Mutex<VecDeque<String>>>;

/// A spawned external tool with its output merged into one line sequence.
pub struct ProcessHandle {
    binary: String,
    child: Child,
    lines: mpsc::Receiver<String>,
    stderr_tail: Tail,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let binary = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string_lossy().into_owned());

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a termination request also reaches helpers the
        // tool starts (the extractor runs the encoder for merging).
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| AppError::Spawn {
            binary: binary.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let stderr_tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone(), None)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx, Some(stderr_tail.clone()))));
        }

        log::debug!("[RUNNER] Spawned {} (pid {:?})", binary, child.id());

        Ok(Self {
            binary,
            child,
            lines: rx,
            stderr_tail,
            readers,
        })
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Next output line from stdout or stderr; `None` once both are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn lines(&mut self) -> impl Stream<Item = String> + '_ {
        futures::stream::poll_fn(move |cx| self.lines.poll_recv(cx))
    }

    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.drain_readers().await;
        Ok(status)
    }

    /// Like [`wait`](Self::wait), with a nonzero exit turned into `ProcessFailure`.
    pub async fn wait_success(&mut self) -> Result<()> {
        let status = self.wait().await?;
        if status.success() {
            return Ok(());
        }
        Err(AppError::ProcessFailure {
            binary: self.binary.clone(),
            code: status.code(),
            stderr_tail: self.stderr_tail(),
        })
    }

    /// Asks the process to exit and forces it after `grace`. A forced kill is
    /// reported as `CancellationTimeout`; the process is gone either way.
    pub async fn kill(&mut self, grace: Duration) -> Result<()> {
        self.lines.close();

        if let Ok(Some(_)) = self.child.try_wait() {
            self.drain_readers().await;
            return Ok(());
        }

        self.terminate();
        let result = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.force_kill();
                self.child.wait().await?;
                Err(AppError::CancellationTimeout { grace })
            }
        };

        self.drain_readers().await;
        result
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        let _ = self.child.start_kill();
    }

    /// Output readers end at EOF; a stray grandchild holding the pipe open must
    /// not keep us here.
    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Splits on both `\n` and `\r`; the encoder redraws its status line with `\r`.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>, tail: Option<Tail>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                log::debug!("[RUNNER] Output stream error: {}", e);
                break;
            }
        };

        let mut complete = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    complete.push(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
        let consumed = chunk.len();
        reader.consume(consumed);

        for line in complete {
            deliver(&tx, tail.as_ref(), line).await;
        }
    }

    if !pending.is_empty() {
        deliver(&tx, tail.as_ref(), String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

async fn deliver(tx: &mpsc::Sender<String>, tail: Option<&Tail>, line: String) {
    let line = line.trim_end().to_string();
    if line.trim().is_empty() {
        return;
    }

    if let Some(tail) = tail {
        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
    }

    // Keep draining the pipe even if nobody listens any more.
    let _ = tx.send(line).await;
}

/// Runs jobs through the extractor and, when asked for, the encoder.
pub struct ProcessRunner {
    extractor: PathBuf,
    encoder: Option<PathBuf>,
    js_runtime: Option<PathBuf>,
    kill_grace: Duration,
    cookies: Option<Arc<RwLock<CookieStore>>>,
}

/// Files and directories one job has created so far.
struct Artifacts<'a> {
    reporter: &'a JobReporter,
    paths: BTreeSet<PathBuf>,
}

#[derive(Default)]
struct ExtractorScan {
    last_destination: Option<PathBuf>,
    already_downloaded: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(extractor: PathBuf) -> Self {
        Self {
            extractor,
            encoder: None,
            js_runtime: None,
            kill_grace: DEFAULT_KILL_GRACE,
            cookies: None,
        }
    }

    pub fn with_encoder(mut self, encoder: Option<PathBuf>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_js_runtime(mut self, js_runtime: Option<PathBuf>) -> Self {
        self.js_runtime = js_runtime;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_cookie_store(mut self, store: Arc<RwLock<CookieStore>>) -> Self {
        self.cookies = Some(store);
        self
    }

    /// Spawns the extractor for `job`.
    pub fn start(&self, job: &Job, staging_dir: Option<&Path>, cookie_file: Option<&Path>) -> Result<ProcessHandle> {
        let ctx = ExtractorContext {
            staging_dir,
            cookie_file,
            js_runtime: self.js_runtime.as_deref(),
            encoder: self.encoder.as_deref(),
        };
        let args = build_extractor_args(&job.source_url, &job.options, &ctx);
        log::debug!("[RUNNER] {} {}", self.extractor.display(), args.join(" "));
        ProcessHandle::spawn(&self.extractor, &args)
    }

    async fn run(
        &self,
        job: &Job,
        reporter: &JobReporter,
        cancel: &mut CancelSignal,
        artifacts: &mut Artifacts<'_>,
    ) -> Result<Option<PathBuf>> {
        let destination = &job.options.destination;
        let staging = destination.join(format!("{}{}", STAGING_PREFIX, job.id));
        tokio::fs::create_dir_all(&staging).await?;
        artifacts.track(staging.clone()).await;

        let cookie_file = match job.options.auth {
            AuthSource::SessionCookies => self.export_cookies(&staging).await?,
            _ => None,
        };
        if let Some(path) = &cookie_file {
            artifacts.track(path.clone()).await;
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut handle = self.start(job, Some(&staging), cookie_file.as_deref())?;
        log::info!("[RUNNER] Job {}: {} started", job.id, handle.binary());

        let mut scan = ExtractorScan::default();
        loop {
            tokio::select! {
                line = handle.next_line() => match line {
                    Some(line) => self.on_extractor_line(&staging, reporter, artifacts, &mut scan, line).await,
                    None => break,
                },
                _ = cancel.cancelled() => return Err(self.stop(&mut handle, &job.id).await),
            }
        }
        tokio::select! {
            result = handle.wait_success() => result?,
            _ = cancel.cancelled() => return Err(self.stop(&mut handle, &job.id).await),
        }

        if let Some(existing) = scan.already_downloaded.as_ref().filter(|path| !path.starts_with(&staging)) {
            reporter.log("File already exists; download skipped").await;
            return Ok(Some(existing.clone()));
        }

        let announced = scan.already_downloaded.or(scan.last_destination);
        let Some(staged) = resolve_output(&staging, announced.as_deref()) else {
            log::warn!("[RUNNER] Job {}: finished but the output file could not be determined", job.id);
            return Ok(None);
        };

        if job.options.needs_encoding() {
            if let Err(e) = self.transcode(job, reporter, cancel, artifacts, &staged).await {
                if !matches!(e, AppError::Cancelled) && !cancel.is_cancelled() {
                    self.keep_unencoded(job, reporter, &staged).await;
                }
                return Err(e);
            }
        }

        let output = place_output(&staged, destination, job.options.overwrite).await?;
        log::info!("[RUNNER] Job {}: saved {:?}", job.id, output);

        if let Err(e) = filetime::set_file_mtime(&output, filetime::FileTime::now()) {
            log::warn!("[RUNNER] Could not update modification time of {:?}: {}", output, e);
        }
        Ok(Some(output))
    }

    async fn on_extractor_line(
        &self,
        staging: &Path,
        reporter: &JobReporter,
        artifacts: &mut Artifacts<'_>,
        scan: &mut ExtractorScan,
        line: String,
    ) {
        match parse_line(&line) {
            ParsedLine::Progress(update) => {
                reporter
                    .progress(JobProgress {
                        phase: JobPhase::Downloading,
                        percent: Some(update.percent),
                        speed_bytes_per_sec: update.speed_bytes_per_sec,
                        eta_seconds: update.eta_seconds,
                    })
                    .await;
            }
            ParsedLine::Destination(path) => {
                let path = absolute_in(staging, path);
                // Only what the job itself creates is temporary.
                if path.starts_with(staging) {
                    for partial in partial_paths(&path) {
                        artifacts.track(partial).await;
                    }
                } else {
                    log::warn!("[RUNNER] Extractor announced a file outside its staging directory: {:?}", path);
                }
                scan.last_destination = Some(path);
                reporter.log(line).await;
            }
            ParsedLine::AlreadyDownloaded(path) => {
                scan.already_downloaded = Some(absolute_in(staging, path));
                reporter.log(line).await;
            }
            ParsedLine::Log(text) => reporter.log(text).await,
        }
    }

    /// Re-encodes the staged `output` in place. The download is moved aside to a
    /// raw name first and put back if encoding fails.
    async fn transcode(
        &self,
        job: &Job,
        reporter: &JobReporter,
        cancel: &mut CancelSignal,
        artifacts: &mut Artifacts<'_>,
        output: &Path,
    ) -> Result<()> {
        let encoder = self
            .encoder
            .as_deref()
            .ok_or_else(|| AppError::ToolNotFound("ffmpeg".to_string()))?;

        let raw = processing::raw_path_for(output);
        remove_artifact(&raw).await?;
        tokio::fs::rename(output, &raw).await?;
        artifacts.track(raw.clone()).await;
        artifacts.track(output.to_path_buf()).await;

        log::info!("[RUNNER] Job {}: encoding with {:?} ({:?})", job.id, job.options.codec, job.options.preset);
        reporter
            .progress(JobProgress {
                phase: JobPhase::Encoding,
                percent: Some(0.0),
                ..JobProgress::default()
            })
            .await;

        match self.encode(job, reporter, cancel, encoder, &raw, output).await {
            Ok(()) => {
                if let Err(e) = remove_artifact(&raw).await {
                    log::warn!("[RUNNER] Could not remove {:?}: {}", raw, e);
                }
                artifacts.release(&raw).await;
                artifacts.release(output).await;
                Ok(())
            }
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(e) if cancel.is_cancelled() => {
                log::debug!("[RUNNER] Job {}: encoder stopped by cancellation: {}", job.id, e);
                Err(AppError::Cancelled)
            }
            Err(e) => {
                if let Err(cleanup) = remove_artifact(output).await {
                    log::warn!("[RUNNER] Could not remove partial {:?}: {}", output, cleanup);
                }
                match tokio::fs::rename(&raw, output).await {
                    Ok(()) => {
                        artifacts.release(&raw).await;
                        artifacts.release(output).await;
                    }
                    Err(restore) => log::error!("[RUNNER] Could not restore {:?}: {}", raw, restore),
                }
                Err(e)
            }
        }
    }

    async fn encode(
        &self,
        job: &Job,
        reporter: &JobReporter,
        cancel: &mut CancelSignal,
        encoder: &Path,
        raw: &Path,
        output: &Path,
    ) -> Result<()> {
        let mut duration = tokio::select! {
            duration = processing::probe_duration(encoder, raw) => duration,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        let args = processing::build_encoder_args(raw, &job.options, output);
        log::debug!("[RUNNER] {} {}", encoder.display(), args.join(" "));
        let mut handle = ProcessHandle::spawn(encoder, &args)?;

        loop {
            tokio::select! {
                line = handle.next_line() => match line {
                    Some(line) => {
                        if duration.is_none() {
                            duration = parse_encoder_duration(&line);
                        }
                        match parse_encoder_time(&line) {
                            Some(position) => {
                                if let Some(percent) = duration.and_then(|total| encoder_percent(position, total)) {
                                    reporter
                                        .progress(JobProgress {
                                            phase: JobPhase::Encoding,
                                            percent: Some(percent),
                                            ..JobProgress::default()
                                        })
                                        .await;
                                }
                            }
                            None => reporter.log(line).await,
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => return Err(self.stop(&mut handle, &job.id).await),
            }
        }

        tokio::select! {
            result = handle.wait_success() => result,
            _ = cancel.cancelled() => Err(self.stop(&mut handle, &job.id).await),
        }
    }

    /// A failed encode still hands over the download as the extractor made it.
    async fn keep_unencoded(&self, job: &Job, reporter: &JobReporter, staged: &Path) {
        if !staged.is_file() {
            return;
        }
        match place_output(staged, &job.options.destination, job.options.overwrite).await {
            Ok(kept) => {
                reporter
                    .log(format!("Encoding failed; kept the original download as {}", kept.display()))
                    .await
            }
            Err(e) => log::error!("[RUNNER] Job {}: could not keep {:?}: {}", job.id, staged, e),
        }
    }

    async fn stop(&self, handle: &mut ProcessHandle, job_id: &str) -> AppError {
        log::info!("[RUNNER] Job {}: stopping {}", job_id, handle.binary());
        if let Err(e) = handle.kill(self.kill_grace).await {
            log::warn!("[RUNNER] Job {}: {}", job_id, e);
        }
        AppError::Cancelled
    }

    async fn export_cookies(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let Some(store) = &self.cookies else {
            log::warn!("[RUNNER] Session cookies requested but no cookie store is configured");
            return Ok(None);
        };
        let store = store.read().await;
        store.export_for_job(dir).await
    }
}

#[async_trait]
impl JobExecutor for ProcessRunner {
    async fn execute(&self, job: &Job, reporter: &JobReporter, mut cancel: CancelSignal) -> ExecutionOutcome {
        let mut artifacts = Artifacts {
            reporter,
            paths: BTreeSet::new(),
        };

        let result = self.run(job, reporter, &mut cancel, &mut artifacts).await;
        artifacts.remove_all().await;

        match result {
            Ok(output_file) => {
                log::info!("[RUNNER] Job {} finished: {:?}", job.id, output_file);
                ExecutionOutcome::Completed { output_file }
            }
            Err(AppError::Cancelled) => ExecutionOutcome::Cancelled,
            Err(e) if cancel.is_cancelled() => {
                log::debug!("[RUNNER] Job {} ended during cancellation: {}", job.id, e);
                ExecutionOutcome::Cancelled
            }
            Err(e) => ExecutionOutcome::Failed(e),
        }
    }
}

impl Artifacts<'_> {
    async fn track(&mut self, path: PathBuf) {
        if self.paths.insert(path.clone()) {
            self.reporter.track_artifact(&path).await;
        }
    }

    /// The path is a keeper, not a temporary.
    async fn release(&mut self, path: &Path) {
        if self.paths.remove(path) {
            self.reporter.untrack_artifact(path).await;
        }
    }

    async fn remove_all(&mut self) {
        for path in std::mem::take(&mut self.paths) {
            if let Err(e) = remove_artifact(&path).await {
                log::warn!("[RUNNER] Job {}: could not remove {:?}: {}", self.reporter.job_id(), path, e);
            }
            self.reporter.untrack_artifact(&path).await;
        }
    }
}

fn absolute_in(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// An announced file and the `.part`/`.ytdl` companions the extractor keeps
/// next to it while downloading.
fn partial_paths(announced: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for suffix in [".part", ".ytdl"] {
        let mut companion = announced.as_os_str().to_os_string();
        companion.push(suffix);
        paths.push(PathBuf::from(companion));
    }
    paths.push(announced.to_path_buf());
    paths
}

/// The finished file inside staging: where it was announced, or under the same
/// name at the top of the staging directory.
fn resolve_output(staging: &Path, announced: Option<&Path>) -> Option<PathBuf> {
    let announced = announced?;
    let flattened = announced.file_name().map(|name| staging.join(name));
    std::iter::once(announced.to_path_buf())
        .chain(flattened)
        .filter(|candidate| candidate.starts_with(staging))
        .find(|candidate| candidate.is_file())
}

/// Moves the finished file from staging into `destination`. Without overwrite
/// an existing file keeps its name and the new one gets a numbered name.
async fn place_output(staged: &Path, destination: &Path, overwrite: bool) -> Result<PathBuf> {
    let name = staged
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidState(format!("Output {:?} has no file name", staged)))?;

    let target = if overwrite {
        destination.join(&name)
    } else {
        claim_unique_path(destination, &name).await?
    };

    if let Err(e) = tokio::fs::rename(staged, &target).await {
        if !overwrite {
            // Give back the claimed name.
            let _ = remove_artifact(&target).await;
        }
        return Err(e.into());
    }
    Ok(target)
}
