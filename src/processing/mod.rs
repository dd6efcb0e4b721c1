// Encoder (ffmpeg) side of a job: flag translation and duration probing.
// Running the encode itself is the process runner's job so it can be cancelled
// like any other subprocess.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use crate::config::{QualityPreset, VideoCodec};
use crate::downloader::progress::parse_encoder_duration;
use crate::downloader::DownloadOptions;

/// Video codec flags for one codec/preset pair. Empty for passthrough.
pub fn codec_args(codec: VideoCodec, preset: QualityPreset) -> Vec<&'static str> {
    use QualityPreset::*;

    match codec {
        VideoCodec::Passthrough => Vec::new(),
        VideoCodec::H264 => {
            let mut args = vec!["-c:v", "libx264"];
            args.extend_from_slice(match preset {
                Lossless => &["-crf", "0", "-preset", "ultrafast"],
                NearLossless => &["-crf", "17", "-preset", "slow"],
                Balanced => &["-crf", "23", "-preset", "medium"],
                MaxCompression => &["-crf", "28", "-preset", "veryslow"],
            });
            args
        }
        VideoCodec::H264Nvenc => {
            let mut args = vec!["-c:v", "h264_nvenc"];
            args.extend_from_slice(match preset {
                Lossless => &["-preset", "p7", "-rc", "constqp", "-qp", "0"],
                NearLossless => &["-preset", "p6", "-cq", "19", "-rc", "vbr_hq"],
                Balanced => &["-preset", "p4", "-b:v", "5M"],
                MaxCompression => &["-preset", "p7", "-cq", "30", "-rc", "vbr_hq"],
            });
            args
        }
        VideoCodec::Hevc => {
            let mut args = vec!["-c:v", "libx265"];
            args.extend_from_slice(match preset {
                Lossless => &["-x265-params", "lossless=1"],
                NearLossless => &["-crf", "20", "-preset", "slow"],
                Balanced => &["-crf", "26", "-preset", "medium"],
                MaxCompression => &["-crf", "30", "-preset", "veryslow"],
            });
            args
        }
        VideoCodec::Vp9 => {
            let mut args = vec!["-c:v", "libvpx-vp9"];
            args.extend_from_slice(match preset {
                Lossless => &["-lossless", "1"],
                NearLossless => &["-crf", "15", "-b:v", "0"],
                Balanced => &["-crf", "30", "-b:v", "0"],
                MaxCompression => &["-crf", "40", "-b:v", "0"],
            });
            args
        }
    }
}

/// Re-encode `input` into `output`; audio streams are copied untouched.
pub fn build_encoder_args(input: &Path, options: &DownloadOptions, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    if options.threads > 1 {
        args.push("-threads".into());
        args.push(options.threads.to_string());
    }

    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());
    args.extend(codec_args(options.codec, options.preset).into_iter().map(String::from));
    args.push("-c:a".into());
    args.push("copy".into());
    args.push(output.to_string_lossy().into_owned());
    args
}

/// `<dir>/<stem>_raw.<ext>`, where the download waits while it is re-encoded.
pub fn raw_path_for(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match file.extension() {
        Some(ext) => format!("{}_raw.{}", stem, ext.to_string_lossy()),
        None => format!("{}_raw", stem),
    };
    file.with_file_name(name)
}

/// Media duration in seconds as reported by the encoder's input banner.
/// `None` when the encoder cannot tell; encoding still proceeds without percentages.
pub async fn probe_duration(encoder: &Path, input: &Path) -> Option<f64> {
    let output = tokio::process::Command::new(encoder)
        .arg("-hide_banner")
        .arg("-i")
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(output) => String::from_utf8_lossy(&output.stderr)
            .lines()
            .find_map(parse_encoder_duration),
        Err(e) => {
            log::warn!("[ENCODER] Could not probe {:?}: {}", input, e);
            None
        }
    }
}
