use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};

use crate::config::{AppConfig, MediaKind, QualityPreset, VideoCodec};
use crate::downloader::events::{spawn_log_writer, EventKind, EventSink, Subscription};
use crate::downloader::manager::{JobRegistry, JobWatcher};
use crate::downloader::process::ProcessRunner;
use crate::downloader::{AuthSource, DownloadOptions, Job, JobId, JobPhase, JobProgress, JobState, TimeRange};
use crate::errors::{AppError, Result};
use crate::security::{CookieStatus, CookieStore, InputValidator};
use crate::tools::ToolSet;
use crate::utils::ensure_dir_exists;

// State management
pub struct AppState {
    pub config: Arc<Mutex<AppConfig>>,
    pub config_path: PathBuf,
    pub cookie_store: Arc<RwLock<CookieStore>>,
    pub registry: JobRegistry,
}

/// One URL plus whatever the command line overrides for it. Unset fields fall
/// back to the saved settings.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: Option<PathBuf>,
    pub media: Option<MediaKind>,
    pub container: Option<String>,
    pub codec: Option<VideoCodec>,
    pub preset: Option<QualityPreset>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub auth: Option<AuthSource>,
    pub overwrite: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub url: String,
    pub destination: Option<PathBuf>,
}

impl AppState {
    /// Wires the runner, registry and event consumers together. Must be called
    /// from inside the runtime.
    pub fn new(config: AppConfig, config_path: PathBuf, cookie_store: Arc<RwLock<CookieStore>>, tools: ToolSet) -> Self {
        let runner = ProcessRunner::new(tools.extractor)
            .with_encoder(tools.encoder)
            .with_js_runtime(tools.js_runtime)
            .with_kill_grace(config.kill_grace())
            .with_cookie_store(cookie_store.clone());

        let registry = JobRegistry::new(
            Arc::new(runner),
            EventSink::new(config.event_buffer),
            config.max_concurrent_downloads,
        );

        spawn_log_writer(registry.events());
        if let Some(retention) = config.job_retention() {
            registry.spawn_retention_sweeper(retention);
        }

        Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            cookie_store,
            registry,
        }
    }
}

/// Resolves a request against the saved preferences. The configured download
/// folder is created on demand; an explicit destination must already exist.
pub async fn build_options(config: &AppConfig, request: &DownloadRequest) -> Result<DownloadOptions> {
    let destination = match &request.destination {
        Some(destination) => destination.clone(),
        None => {
            ensure_dir_exists(&config.download_path).await?;
            config.download_path.clone()
        }
    };

    let auth = request.auth.clone().unwrap_or_else(|| config.auth.clone());
    let mut options = DownloadOptions::from_preferences(&config.encoding, destination, auth);

    if let Some(media) = request.media {
        options.media = media;
    }
    if let Some(container) = &request.container {
        options.container = Some(container.to_ascii_lowercase());
    }
    if let Some(codec) = request.codec {
        options.codec = codec;
    }
    if let Some(preset) = request.preset {
        options.preset = preset;
    }
    if let Some(overwrite) = request.overwrite {
        options.overwrite = overwrite;
    }
    if request.start.is_some() || request.end.is_some() {
        options.section = Some(TimeRange {
            start: request.start.clone(),
            end: request.end.clone(),
        });
    }

    Ok(options)
}

/// Submits every request, renders progress until all accepted jobs are
/// finished and returns their final snapshots in submission order.
///
/// A request that fails validation is reported and skipped; when nothing at all
/// was accepted the first rejection is returned.
pub async fn download(state: &AppState, requests: Vec<DownloadRequest>) -> Result<Vec<Job>> {
    let renderer = ProgressRenderer::spawn(state.registry.events());

    let mut submitted: Vec<JobWatcher> = Vec::new();
    let mut first_error = None;

    for request in &requests {
        match submit_request(state, request).await {
            Ok(watcher) => {
                submitted.push(watcher);
                let mut config = state.config.lock().await;
                config.add_history(request.url.trim());
                if let Some(destination) = &request.destination {
                    config.download_path = destination.clone();
                }
            }
            Err(e) => {
                log::error!("Rejected {}: {}", request.url, e);
                first_error.get_or_insert(e);
            }
        }
    }

    if submitted.is_empty() {
        renderer.finish().await;
        return Err(first_error.unwrap_or_else(|| AppError::InvalidInput("Nothing to download".to_string())));
    }

    if let Err(e) = state.config.lock().await.save_to(&state.config_path) {
        log::warn!("Failed to save settings: {}", e);
    }

    // Watchers were taken at submission, so a job the retention sweep has
    // already dropped still reports its final state.
    let finished = futures::future::join_all(submitted.into_iter().map(JobWatcher::finished)).await;
    log::info!("{} job(s) finished, {} still held by the registry", finished.len(), state.registry.len().await);

    renderer.finish().await;
    Ok(finished)
}

async fn submit_request(state: &AppState, request: &DownloadRequest) -> Result<JobWatcher> {
    let options = {
        let config = state.config.lock().await;
        build_options(&config, request).await?
    };
    let job_id = state.registry.submit(&request.url, options).await?;
    state.registry.watch(&job_id).await
}

/// Reads `url[,destination]` rows. A leading `url` header row, blank rows and
/// `#` comments are skipped.
pub fn read_batch_file(path: &Path) -> Result<Vec<BatchEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut entries = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let record = result?;
        let url = record.get(0).unwrap_or("");

        if url.is_empty() || (index == 0 && url.eq_ignore_ascii_case("url")) {
            continue;
        }

        let destination = record
            .get(1)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        entries.push(BatchEntry {
            url: url.to_string(),
            destination,
        });
    }

    log::info!("Read {} entries from {}", entries.len(), path.display());
    Ok(entries)
}

pub async fn import_cookies(cookie_store: &RwLock<CookieStore>, path: &Path) -> Result<usize> {
    InputValidator::new().validate_file_path(path)?;
    let store = cookie_store.write().await;
    store.import_file(path).await
}

pub async fn cookie_status(cookie_store: &RwLock<CookieStore>) -> Result<CookieStatus> {
    cookie_store.read().await.status().await
}

pub async fn clear_cookies(cookie_store: &RwLock<CookieStore>) -> Result<()> {
    cookie_store.write().await.delete_cookies().await
}

pub async fn get_settings(config: &Mutex<AppConfig>) -> Result<String> {
    let config = config.lock().await;
    Ok(serde_json::to_string_pretty(&*config)?)
}

/// Changes one setting and persists the result.
pub async fn update_setting(config: &Mutex<AppConfig>, key: &str, value: &str, path: &Path) -> Result<()> {
    let mut config = config.lock().await;
    config.set_value(key, value)?;
    config.save_to(path)?;
    log::info!("Setting {} updated", key);
    Ok(())
}

/// One progress bar per job, fed from the event sink.
struct ProgressRenderer {
    task: tokio::task::JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl ProgressRenderer {
    fn spawn(events: &EventSink) -> Self {
        let subscription = events.subscribe();
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(render(subscription, stop_rx));
        Self { task, stop }
    }

    /// Drains what is already queued, then closes every bar.
    async fn finish(self) {
        let _ = self.stop.send(());
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            log::debug!("Progress renderer did not stop in time");
        }
    }
}

async fn render(mut subscription: Subscription, mut stop: oneshot::Receiver<()>) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<JobId, ProgressBar> = HashMap::new();

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => apply_event(&multi, &mut bars, &event.job_id, event.kind),
                None => break,
            },
            _ = &mut stop => {
                while let Some(event) = subscription.try_recv() {
                    apply_event(&multi, &mut bars, &event.job_id, event.kind);
                }
                break;
            }
        }
    }

    for bar in bars.values().filter(|bar| !bar.is_finished()) {
        bar.abandon();
    }
}

fn apply_event(multi: &MultiProgress, bars: &mut HashMap<JobId, ProgressBar>, job_id: &str, kind: EventKind) {
    let bar = bars
        .entry(job_id.to_string())
        .or_insert_with(|| multi.add(new_bar(job_id)));

    match kind {
        EventKind::Progress(progress) => {
            if let Some(percent) = progress.percent {
                bar.set_position(percent.round() as u64);
            }
            bar.set_message(progress_message(&progress));
        }
        EventKind::StateChanged { state, error } => match state {
            JobState::Completed => bar.finish_with_message("done"),
            JobState::Cancelled => bar.abandon_with_message("cancelled"),
            JobState::Failed => bar.abandon_with_message(format!("failed: {}", error.unwrap_or_default())),
            other => bar.set_message(other.to_string()),
        },
        EventKind::Log(_) => bar.tick(),
    }
}

fn new_bar(job_id: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {prefix} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_prefix(job_id.chars().take(8).collect::<String>());
    bar
}

fn progress_message(progress: &JobProgress) -> String {
    let mut parts = vec![match progress.phase {
        JobPhase::Downloading => "downloading".to_string(),
        JobPhase::Encoding => "encoding".to_string(),
    }];
    if let Some(speed) = progress.speed_bytes_per_sec {
        parts.push(format!("{}/s", HumanBytes(speed)));
    }
    if let Some(eta) = progress.eta_seconds {
        parts.push(format!("ETA {:02}:{:02}", eta / 60, eta % 60));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_replace_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.download_path = dir.path().join("default");

        let request = DownloadRequest {
            url: "https://example.com/v".to_string(),
            codec: Some(VideoCodec::Vp9),
            container: Some("WEBM".to_string()),
            end: Some("1:30".to_string()),
            ..DownloadRequest::default()
        };
        let options = build_options(&config, &request).await.unwrap();

        assert_eq!(options.destination, config.download_path);
        assert!(config.download_path.is_dir());
        assert_eq!(options.codec, VideoCodec::Vp9);
        assert_eq!(options.container.as_deref(), Some("webm"));
        assert_eq!(
            options.section,
            Some(TimeRange {
                start: None,
                end: Some("1:30".to_string())
            })
        );
        assert_eq!(options.auth, AuthSource::None);
    }

    #[tokio::test]
    async fn explicit_destination_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let request = DownloadRequest {
            url: "https://example.com/v".to_string(),
            destination: Some(missing.clone()),
            ..DownloadRequest::default()
        };

        let options = build_options(&AppConfig::default(), &request).await.unwrap();
        assert_eq!(options.destination, missing);
        assert!(!missing.exists());
    }

    #[test]
    fn batch_file_skips_header_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.csv");
        std::fs::write(
            &path,
            "url,destination\n# later\nhttps://example.com/a\n\nhttps://example.com/b, /srv/videos \n",
        )
        .unwrap();

        let entries = read_batch_file(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                BatchEntry {
                    url: "https://example.com/a".to_string(),
                    destination: None
                },
                BatchEntry {
                    url: "https://example.com/b".to_string(),
                    destination: Some(PathBuf::from("/srv/videos"))
                },
            ]
        );
    }

    #[test]
    fn missing_batch_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_batch_file(&dir.path().join("nope.csv")).is_err());
    }

    #[test]
    fn progress_message_formats_speed_and_eta() {
        let progress = JobProgress {
            phase: JobPhase::Downloading,
            percent: Some(12.5),
            speed_bytes_per_sec: Some(2048),
            eta_seconds: Some(75),
        };
        assert_eq!(progress_message(&progress), "downloading | 2.00 KiB/s | ETA 01:15");
    }

    #[tokio::test]
    async fn settings_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let config = Mutex::new(AppConfig::default());

        update_setting(&config, "event_buffer", "512", &path).await.unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap().event_buffer, 512);
        assert!(get_settings(&config).await.unwrap().contains("\"event_buffer\": 512"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn jobs_swept_before_the_batch_ends_are_still_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("videos");
        std::fs::create_dir_all(&dest).unwrap();
        let extractor = dir.path().join("fake-yt-dlp");
        std::fs::write(
            &extractor,
            r#"#!/bin/sh
home=""
url=""
while [ $# -gt 0 ]; do
  case "$1" in
    -P) case "$2" in temp:*) ;; *) home="$2" ;; esac; shift 2 ;;
    *) url="$1"; shift ;;
  esac
done
case "$url" in *slow*) sleep 3 ;; esac
name=$(echo "$url" | sed 's/.*=//')
echo "[download] Destination: $home/$name.mp4"
printf 'video' > "$home/$name.mp4"
"#,
        )
        .unwrap();
        std::fs::set_permissions(&extractor, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = AppConfig::default();
        config.download_path = dest.clone();
        config.job_retention_secs = 1;
        let cookie_store = Arc::new(RwLock::new(CookieStore::new(&dir.path().join("data")).unwrap()));
        let tools = ToolSet {
            extractor,
            encoder: None,
            js_runtime: None,
        };
        let state = AppState::new(config, dir.path().join("settings.json"), cookie_store, tools);

        let requests = ["https://example.com/watch?v=slow", "https://example.com/watch?v=fast"]
            .into_iter()
            .map(|url| DownloadRequest {
                url: url.to_string(),
                ..DownloadRequest::default()
            })
            .collect();
        let jobs = tokio::time::timeout(Duration::from_secs(20), download(&state, requests))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.state == JobState::Completed), "{:?}", jobs);
        assert_eq!(jobs[0].output_file, Some(dest.join("slow.mp4")));
        assert_eq!(jobs[1].output_file, Some(dest.join("fast.mp4")));
        assert!(state.registry.get(&jobs[1].id).await.is_none());
    }
}
