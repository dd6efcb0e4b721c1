use std::path::Path;
use crate::config::MediaKind;
use crate::downloader::{AuthSource, DownloadOptions};

const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const DEFAULT_AUDIO_FORMAT: &str = "mp3";
const MP4_FORMAT: &str =
    "bestvideo[height>1080]+bestaudio/bestvideo[vcodec^=avc]+bestaudio[acodec^=mp4a]/bestvideo+bestaudio/best";
const WEBM_FORMAT: &str =
    "bestvideo[vcodec^=vp9]+bestaudio[acodec^=opus]/bestvideo[ext=webm]+bestaudio[ext=webm]/best[ext=webm]/best";

/// Per-run paths that are not part of the user's options.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractorContext<'a> {
    pub staging_dir: Option<&'a Path>,
    /// Exported session cookies, used for `AuthSource::SessionCookies`.
    pub cookie_file: Option<&'a Path>,
    pub js_runtime: Option<&'a Path>,
    pub encoder: Option<&'a Path>,
}

/// The one place where download options become extractor flags.
pub fn build_extractor_args(url: &str, options: &DownloadOptions, ctx: &ExtractorContext<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec!["--newline".into(), "--no-playlist".into()];

    // With a staging directory the extractor never writes into the destination;
    // the runner moves the finished file there itself.
    let home = ctx.staging_dir.unwrap_or(options.destination.as_path());
    args.push("-P".into());
    args.push(home.to_string_lossy().into_owned());
    if let Some(staging) = ctx.staging_dir {
        args.push("-P".into());
        args.push(format!("temp:{}", staging.to_string_lossy()));
    }
    args.push("-o".into());
    args.push(OUTPUT_TEMPLATE.into());

    args.push(if options.overwrite { "--force-overwrites" } else { "--no-overwrites" }.into());

    if options.split_download && options.fragments > 1 {
        args.push("-N".into());
        args.push(options.fragments.to_string());
    }

    push_format_selection(&mut args, options);

    if let Some(section) = &options.section {
        let start = section.start.as_deref().unwrap_or("0");
        let end = section.end.as_deref().unwrap_or("inf");
        args.push("--download-sections".into());
        args.push(format!("*{}-{}", start, end));
    }

    match &options.auth {
        AuthSource::None => {}
        AuthSource::Browser(name) => {
            args.push("--cookies-from-browser".into());
            args.push(name.clone());
        }
        AuthSource::CookieFile(path) => {
            args.push("--cookies".into());
            args.push(path.to_string_lossy().into_owned());
        }
        AuthSource::SessionCookies => {
            if let Some(path) = ctx.cookie_file {
                args.push("--cookies".into());
                args.push(path.to_string_lossy().into_owned());
            }
        }
    }

    if let Some(runtime) = ctx.js_runtime.and_then(js_runtime_flag) {
        args.push("--js-runtimes".into());
        args.push(runtime);
    }

    if let Some(dir) = ctx.encoder.and_then(Path::parent).filter(|d| !d.as_os_str().is_empty()) {
        args.push("--ffmpeg-location".into());
        args.push(dir.to_string_lossy().into_owned());
    }

    args.push(url.to_string());
    args
}

fn push_format_selection(args: &mut Vec<String>, options: &DownloadOptions) {
    let container = options.container.as_deref().map(str::to_ascii_lowercase);

    if options.media == MediaKind::Audio {
        let audio_format = container.unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string());
        if options.codec.is_passthrough() {
            args.push("-f".into());
            args.push(format!("bestaudio[ext={}]/bestaudio/best", audio_format));
        }
        args.push("-x".into());
        args.push("--audio-format".into());
        args.push(audio_format);
        return;
    }

    let Some(container) = container else {
        return;
    };

    if options.codec.is_passthrough() {
        let selector = match container.as_str() {
            "mp4" => Some(MP4_FORMAT),
            "webm" => Some(WEBM_FORMAT),
            _ => None,
        };
        if let Some(selector) = selector {
            args.push("-f".into());
            args.push(selector.into());
        }
    }
    args.push("--merge-output-format".into());
    args.push(container);
}

/// `deno:/path/to/deno` style value, only for absolute paths of known runtimes.
fn js_runtime_flag(path: &Path) -> Option<String> {
    if !path.is_absolute() {
        return None;
    }
    let stem = path.file_stem()?.to_string_lossy().to_ascii_lowercase();
    let name = ["deno", "node", "bun"].into_iter().find(|name| stem.contains(name))?;
    Some(format!("{}:{}", name, path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncodingConfig, VideoCodec};
    use crate::downloader::TimeRange;
    use std::path::PathBuf;

    fn options() -> DownloadOptions {
        DownloadOptions::from_preferences(&EncodingConfig::default(), PathBuf::from("/videos"), AuthSource::None)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn defaults_select_native_mp4() {
        let args = build_extractor_args("https://example.com/v", &options(), &ExtractorContext::default());

        assert_eq!(args.first().map(String::as_str), Some("--newline"));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
        assert!(args.contains(&"--no-overwrites".to_string()));
        assert_eq!(value_after(&args, "-N"), Some("5"));
        assert_eq!(value_after(&args, "-f"), Some(MP4_FORMAT));
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
        assert_eq!(value_after(&args, "-o"), Some(OUTPUT_TEMPLATE));
        assert_eq!(value_after(&args, "-P"), Some("/videos"));
    }

    #[test]
    fn audio_extraction() {
        let mut opts = options();
        opts.media = MediaKind::Audio;
        opts.container = Some("m4a".to_string());
        let args = build_extractor_args("https://example.com/v", &opts, &ExtractorContext::default());

        assert_eq!(value_after(&args, "-f"), Some("bestaudio[ext=m4a]/bestaudio/best"));
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("m4a"));
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn transcoding_leaves_format_choice_to_extractor() {
        let mut opts = options();
        opts.codec = VideoCodec::Hevc;
        opts.overwrite = true;
        opts.split_download = false;
        let args = build_extractor_args("https://example.com/v", &opts, &ExtractorContext::default());

        assert!(!args.contains(&"-f".to_string()));
        assert!(!args.contains(&"-N".to_string()));
        assert!(args.contains(&"--force-overwrites".to_string()));
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
    }

    #[test]
    fn context_paths_are_passed_through() {
        let mut opts = options();
        opts.auth = AuthSource::SessionCookies;
        opts.section = Some(TimeRange {
            start: Some("00:01:00".to_string()),
            end: None,
        });
        let staging = PathBuf::from("/videos/.vdl-1");
        let cookies = PathBuf::from("/tmp/cookies.txt");
        let deno = PathBuf::from("/opt/deno/deno");
        let ffmpeg = PathBuf::from("/opt/ffmpeg/bin/ffmpeg");
        let ctx = ExtractorContext {
            staging_dir: Some(&staging),
            cookie_file: Some(&cookies),
            js_runtime: Some(&deno),
            encoder: Some(&ffmpeg),
        };
        let args = build_extractor_args("https://example.com/v", &opts, &ctx);

        assert_eq!(value_after(&args, "-P"), Some("/videos/.vdl-1"));
        assert!(args.contains(&"temp:/videos/.vdl-1".to_string()));
        assert!(!args.contains(&"/videos".to_string()));
        assert_eq!(value_after(&args, "--cookies"), Some("/tmp/cookies.txt"));
        assert_eq!(value_after(&args, "--download-sections"), Some("*00:01:00-inf"));
        assert_eq!(value_after(&args, "--js-runtimes"), Some("deno:/opt/deno/deno"));
        assert_eq!(value_after(&args, "--ffmpeg-location"), Some("/opt/ffmpeg/bin"));
    }

    #[test]
    fn browser_cookies_and_session_without_export() {
        let mut opts = options();
        opts.auth = AuthSource::Browser("firefox".to_string());
        let args = build_extractor_args("https://example.com/v", &opts, &ExtractorContext::default());
        assert_eq!(value_after(&args, "--cookies-from-browser"), Some("firefox"));

        opts.auth = AuthSource::SessionCookies;
        let args = build_extractor_args("https://example.com/v", &opts, &ExtractorContext::default());
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn relative_js_runtime_is_ignored() {
        assert_eq!(js_runtime_flag(Path::new("deno")), None);
        assert_eq!(js_runtime_flag(Path::new("/usr/bin/python3")), None);
    }
}
