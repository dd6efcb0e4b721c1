use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use video_downloader::commands::{self, AppState, DownloadRequest};
use video_downloader::config::{AppConfig, MediaKind, QualityPreset, VideoCodec};
use video_downloader::downloader::{AuthSource, Job, JobState};
use video_downloader::logging;
use video_downloader::security::CookieStore;
use video_downloader::tools::ToolSet;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download one or more URLs
    Download {
        #[arg(required = true)]
        urls: Vec<String>,
        #[command(flatten)]
        options: JobArgs,
    },
    /// Download every row of a CSV file (`url[,destination]`)
    Batch {
        file: PathBuf,
        #[command(flatten)]
        options: JobArgs,
    },
    /// Manage the encrypted session cookies
    Cookies {
        #[command(subcommand)]
        action: CookieAction,
    },
    /// Show or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Show which external tools were found
    Tools,
}

#[derive(Subcommand, Debug)]
enum CookieAction {
    /// Merge a Netscape cookies.txt file into the store
    Import { file: PathBuf },
    Status,
    Clear,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    /// Set a top-level key; JSON values are accepted
    Set { key: String, value: String },
}

#[derive(Args, Debug, Clone, Default)]
struct JobArgs {
    /// Destination folder (must exist)
    #[arg(short, long)]
    dest: Option<PathBuf>,
    /// Extract audio only
    #[arg(long)]
    audio: bool,
    /// Output container or audio format, e.g. mp4, webm, mp3
    #[arg(short, long)]
    format: Option<String>,
    /// Re-encode with: passthrough, h264, nvenc, hevc, vp9
    #[arg(long)]
    codec: Option<VideoCodec>,
    /// lossless, near-lossless, balanced, max-compression
    #[arg(long)]
    preset: Option<QualityPreset>,
    /// Section start, e.g. 1:30
    #[arg(long)]
    start: Option<String>,
    /// Section end
    #[arg(long)]
    end: Option<String>,
    /// Read cookies from this browser
    #[arg(long, conflicts_with_all = ["cookies", "session_cookies"])]
    browser: Option<String>,
    /// Use this cookies.txt file
    #[arg(long, conflicts_with = "session_cookies")]
    cookies: Option<PathBuf>,
    /// Use the cookies imported with `cookies import`
    #[arg(long)]
    session_cookies: bool,
    /// Replace files that already exist
    #[arg(long)]
    overwrite: bool,
}

impl JobArgs {
    fn request(&self, url: String, destination: Option<PathBuf>) -> DownloadRequest {
        let auth = if let Some(browser) = &self.browser {
            Some(AuthSource::Browser(browser.clone()))
        } else if let Some(file) = &self.cookies {
            Some(AuthSource::CookieFile(file.clone()))
        } else if self.session_cookies {
            Some(AuthSource::SessionCookies)
        } else {
            None
        };

        DownloadRequest {
            url,
            destination: destination.or_else(|| self.dest.clone()),
            media: self.audio.then_some(MediaKind::Audio),
            container: self.format.clone(),
            codec: self.codec,
            preset: self.preset,
            start: self.start.clone(),
            end: self.end.clone(),
            auth,
            overwrite: self.overwrite.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::get_config_path().context("Failed to locate settings")?,
    };
    let config = AppConfig::load_or_create(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let data_dir = AppConfig::data_dir().context("Failed to locate data directory")?;

    init_logging(cli.verbose, &data_dir, &config);
    log::info!("Starting video-downloader {}", env!("CARGO_PKG_VERSION"));

    let cookie_store = Arc::new(RwLock::new(
        CookieStore::new(&data_dir).context("Failed to open the cookie store")?,
    ));

    match cli.command {
        Command::Download { urls, options } => {
            let requests = urls.into_iter().map(|url| options.request(url, None)).collect();
            run_downloads(config, config_path, cookie_store, requests).await
        }
        Command::Batch { file, options } => {
            let entries = commands::read_batch_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if entries.is_empty() {
                bail!("{} contains no URLs", file.display());
            }
            let requests = entries
                .into_iter()
                .map(|entry| options.request(entry.url, entry.destination))
                .collect();
            run_downloads(config, config_path, cookie_store, requests).await
        }
        Command::Cookies { action } => match action {
            CookieAction::Import { file } => {
                let count = commands::import_cookies(&cookie_store, &file)
                    .await
                    .context("Cookie import failed")?;
                println!("{} cookie(s) stored", count);
                Ok(())
            }
            CookieAction::Status => {
                let status = commands::cookie_status(&cookie_store).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(())
            }
            CookieAction::Clear => {
                commands::clear_cookies(&cookie_store).await?;
                println!("Cookie store cleared");
                Ok(())
            }
        },
        Command::Settings { action } => {
            let config = Mutex::new(config);
            match action {
                SettingsAction::Show => println!("{}", commands::get_settings(&config).await?),
                SettingsAction::Set { key, value } => {
                    commands::update_setting(&config, &key, &value, &config_path)
                        .await
                        .with_context(|| format!("Failed to set {}", key))?;
                }
            }
            Ok(())
        }
        Command::Tools => {
            let tools = ToolSet::discover(&config.tools)?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, data_dir: &Path, config: &AppConfig) {
    let log_dir = data_dir.join("logs");
    if let Err(e) = logging::init(verbose, Some(&log_dir), &config.logging) {
        eprintln!("Logging to {} disabled: {}", log_dir.display(), e);
        let _ = logging::init(verbose, None, &config.logging);
    }
}

async fn run_downloads(config: AppConfig, config_path: PathBuf, cookie_store: Arc<RwLock<CookieStore>>, requests: Vec<DownloadRequest>) -> Result<()> {
    let tools = ToolSet::discover(&config.tools)?;
    let state = AppState::new(config, config_path, cookie_store, tools);

    let registry = state.registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cancelling active downloads");
            if let Err(e) = registry.shutdown().await {
                log::error!("Shutdown failed: {}", e);
            }
        }
    });

    let jobs = commands::download(&state, requests).await?;
    print_summary(&jobs);

    let unfinished = jobs.iter().filter(|job| job.state != JobState::Completed).count();
    if unfinished > 0 {
        bail!("{} of {} download(s) did not complete", unfinished, jobs.len());
    }
    Ok(())
}

fn print_summary(jobs: &[Job]) {
    for job in jobs {
        let detail = match (&job.output_file, &job.error) {
            (_, Some(error)) => error.clone(),
            (Some(file), None) => file.display().to_string(),
            (None, None) => String::new(),
        };
        println!("{:<10} {} {}", job.state.to_string(), job.source_url, detail);
    }
}
