//! Best-effort interpretation of extractor and encoder output.
//!
//! The external tools do not promise a stable output format, so nothing in here
//! fails: a line that cannot be understood is handed back as plain log text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Always within `0.0..=100.0`.
    pub percent: f32,
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Progress(ProgressUpdate),
    /// A file the extractor is about to write (possibly an intermediate one).
    Destination(PathBuf),
    /// The target already exists and the extractor skipped the download.
    AlreadyDownloaded(PathBuf),
    Log(String),
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static progress pattern"))
}

fn download_percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\[download\]\s+(\S+?)%")
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\bat\s+~?\s*(\S+)")
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\bETA\s+(\S+)")
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\[[^\]]+\]\s+Destination:\s+(.+)$")
}

fn merger_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"^\[Merger\]\s+Merging formats into\s+"?(.+?)"?$"#)
}

fn already_downloaded_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\[download\]\s+(.+?)\s+has already been downloaded")
}

fn encoder_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
}

fn encoder_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
}

/// Classifies one line of extractor output.
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();

    if let Some(caps) = already_downloaded_re().captures(line) {
        return ParsedLine::AlreadyDownloaded(PathBuf::from(unquote(&caps[1])));
    }
    if let Some(caps) = destination_re().captures(line) {
        return ParsedLine::Destination(PathBuf::from(unquote(&caps[1])));
    }
    if let Some(caps) = merger_re().captures(line) {
        return ParsedLine::Destination(PathBuf::from(unquote(&caps[1])));
    }
    if let Some(caps) = download_percent_re().captures(line) {
        match parse_percent(&caps[1]) {
            Some(percent) => {
                return ParsedLine::Progress(ProgressUpdate {
                    percent,
                    speed_bytes_per_sec: speed_re()
                        .captures(line)
                        .and_then(|c| parse_speed(&c[1])),
                    eta_seconds: eta_re()
                        .captures(line)
                        .and_then(|c| parse_clock(&c[1]))
                        .map(|secs| secs.round() as u64),
                });
            }
            None => log::debug!("[PROGRESS] Unreadable percent in line: {}", line),
        }
    }

    ParsedLine::Log(line.to_string())
}

/// `Duration: 00:03:25.04` from the encoder's input banner, in seconds.
pub fn parse_encoder_duration(line: &str) -> Option<f64> {
    let caps = encoder_duration_re().captures(line)?;
    clock_parts_to_secs(&caps[1], &caps[2], &caps[3])
}

/// `time=00:01:02.50` from an encoder status line, in seconds.
pub fn parse_encoder_time(line: &str) -> Option<f64> {
    let caps = encoder_time_re().captures(line)?;
    clock_parts_to_secs(&caps[1], &caps[2], &caps[3])
}

pub fn encoder_percent(position_secs: f64, duration_secs: f64) -> Option<f32> {
    if !(duration_secs > 0.0) || !position_secs.is_finite() {
        return None;
    }
    Some(((position_secs / duration_secs) * 100.0).clamp(0.0, 100.0) as f32)
}

fn parse_percent(raw: &str) -> Option<f32> {
    let value: f32 = raw.trim().parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

/// `1.20MiB/s`, `850.3KiB/s`, `2.5MB/s`; anything else is unknown.
fn parse_speed(raw: &str) -> Option<u64> {
    let raw = raw.trim().strip_suffix("/s")?;
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };

    let bytes = value * multiplier;
    (bytes.is_finite() && bytes >= 0.0).then(|| bytes.round() as u64)
}

/// `SS`, `MM:SS` or `HH:MM:SS`, seconds possibly fractional.
fn parse_clock(raw: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut fields = 0;
    for part in raw.trim().split(':') {
        let value: f64 = part.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        total = total * 60.0 + value;
        fields += 1;
    }
    (1..=3).contains(&fields).then_some(total)
}

fn clock_parts_to_secs(h: &str, m: &str, s: &str) -> Option<f64> {
    let hours: f64 = h.parse().ok()?;
    let minutes: f64 = m.parse().ok()?;
    let seconds: f64 = s.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}
