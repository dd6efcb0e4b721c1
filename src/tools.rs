use crate::config::ToolPaths;
use crate::errors::{AppError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const EXTRACTOR: &str = "yt-dlp";
pub const ENCODER: &str = "ffmpeg";
const JS_RUNTIMES: [&str; 2] = ["deno", "node"];

/// External binaries the runner needs, resolved once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSet {
    pub extractor: PathBuf,
    pub encoder: Option<PathBuf>,
    pub js_runtime: Option<PathBuf>,
}

impl ToolSet {
    /// The extractor is required; a missing encoder only disables re-encoding and
    /// a missing JS runtime only makes some sites fail.
    pub fn discover(overrides: &ToolPaths) -> Result<Self> {
        let base_dirs = base_dirs();

        let extractor = resolve_binary(EXTRACTOR, overrides.extractor.as_deref(), &base_dirs)
            .ok_or_else(|| AppError::ToolNotFound(EXTRACTOR.to_string()))?;

        let encoder = resolve_binary(ENCODER, overrides.encoder.as_deref(), &base_dirs);
        if encoder.is_none() {
            log::warn!("[TOOLS] {} not found; re-encoding and format merging will fail", ENCODER);
        }

        let js_runtime = match overrides.js_runtime.as_deref() {
            Some(path) => resolve_binary(JS_RUNTIMES[0], Some(path), &base_dirs),
            None => JS_RUNTIMES
                .iter()
                .find_map(|name| resolve_binary(name, None, &base_dirs)),
        };
        if js_runtime.is_none() {
            log::warn!("[TOOLS] No JavaScript runtime (deno or node) found; some sites may not work");
        }

        log::info!("[TOOLS] Using {} at {}", EXTRACTOR, extractor.display());
        Ok(Self {
            extractor,
            encoder,
            js_runtime,
        })
    }
}

/// Configured path first, then `libs/<name>/<name>` next to the executable or
/// the working directory, then `PATH`. Files that cannot be executed are
/// skipped, so a bad binary is reported here and not by every job.
pub fn resolve_binary(name: &str, configured: Option<&Path>, base_dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = configured {
        if is_executable(path) {
            return Some(path.to_path_buf());
        }
        if path.is_file() {
            log::warn!("[TOOLS] Configured {} path {:?} is not executable", name, path);
        } else {
            log::warn!("[TOOLS] Configured {} path {:?} does not exist", name, path);
        }
    }

    let file_name = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };

    base_dirs
        .iter()
        .map(|base| base.join("libs").join(name).join(&file_name))
        .find(|candidate| {
            let usable = is_executable(candidate);
            if !usable && candidate.is_file() {
                log::warn!("[TOOLS] Skipping bundled {:?}: not executable", candidate);
            }
            usable
        })
        .or_else(|| which::which(name).ok())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn base_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        dirs.push(exe_dir);
    }
    if let Ok(cwd) = std::env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd);
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tool(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn bundled_layout_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let name = "vdl-test-tool";
        let file_name = if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() };
        let bundled = dir.path().join("libs").join(name).join(file_name);
        write_tool(&bundled);

        assert_eq!(resolve_binary(name, None, &[dir.path().to_path_buf()]), Some(bundled));
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("custom-yt-dlp");
        write_tool(&configured);

        assert_eq!(resolve_binary(EXTRACTOR, Some(&configured), &[]), Some(configured));
    }

    #[test]
    fn unknown_tool_is_none() {
        assert_eq!(resolve_binary("vdl-no-such-binary-anywhere", None, &[]), None);
    }

    #[cfg(unix)]
    #[test]
    fn files_without_exec_permission_are_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let name = "vdl-test-noexec";
        let bundled = dir.path().join("libs").join(name).join(name);
        write_tool(&bundled);
        std::fs::set_permissions(&bundled, std::fs::Permissions::from_mode(0o644)).unwrap();
        let configured = dir.path().join("custom-noexec");
        std::fs::write(&configured, b"#!/bin/sh\n").unwrap();

        assert_eq!(resolve_binary(name, Some(&configured), &[dir.path().to_path_buf()]), None);

        std::fs::set_permissions(&bundled, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_binary(name, Some(&configured), &[dir.path().to_path_buf()]), Some(bundled));
    }
}
