use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} executable not found")]
    ToolNotFound(String),

    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with {}: {stderr_tail}", exit_code_text(.code))]
    ProcessFailure {
        binary: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Process did not exit within {grace:?} of the termination request and was killed")]
    CancellationTimeout { grace: Duration },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Encryption error: {0}")]
    Encryption(String),
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_failure_message_carries_tail() {
        let err = AppError::ProcessFailure {
            binary: "yt-dlp".to_string(),
            code: Some(1),
            stderr_tail: "ERROR: Video unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "yt-dlp exited with code 1: ERROR: Video unavailable");
    }

    #[test]
    fn process_failure_without_code_mentions_signal() {
        let err = AppError::ProcessFailure {
            binary: "ffmpeg".to_string(),
            code: None,
            stderr_tail: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
