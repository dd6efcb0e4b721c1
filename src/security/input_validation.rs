use crate::errors::{AppError, Result};
use url::Url;
use std::path::Path;

pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Any http(s) URL with a host. Which sites actually work is up to the extractor.
    pub fn validate_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::InvalidInput("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::InvalidInput(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::InvalidInput(format!(
                "Unsupported URL scheme: {}. Only http and https are accepted",
                parsed_url.scheme()
            )));
        }

        if parsed_url.host_str().map_or(true, str::is_empty) {
            return Err(AppError::InvalidInput("URL must have a host".to_string()));
        }

        Ok(())
    }

    pub fn validate_file_path(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::InvalidInput("File path cannot be empty".to_string()));
        }

        if path.to_string_lossy().contains('\0') {
            return Err(AppError::InvalidInput("Null bytes not allowed in file path".to_string()));
        }

        if !path.is_file() {
            return Err(AppError::InvalidInput(format!("Not a file: {}", path.display())));
        }

        Ok(())
    }

    pub fn validate_destination_dir(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::InvalidInput("Download path cannot be empty".to_string()));
        }

        if !path.exists() {
            return Err(AppError::InvalidInput(format!("Download path does not exist: {}", path.display())));
        }

        if !path.is_dir() {
            return Err(AppError::InvalidInput(format!("Download path is not a directory: {}", path.display())));
        }

        let readonly = path.metadata()?.permissions().readonly();
        if readonly {
            return Err(AppError::InvalidInput(format!("Download path is read-only: {}", path.display())));
        }

        Ok(())
    }

    /// `SS`, `MM:SS` or `HH:MM:SS`, seconds optionally fractional.
    pub fn validate_timestamp(&self, value: &str) -> Result<()> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        let valid = (1..=3).contains(&parts.len())
            && parts.iter().enumerate().all(|(i, part)| {
                let last = i == parts.len() - 1;
                !part.is_empty()
                    && if last {
                        part.parse::<f64>().map_or(false, |v| v.is_finite() && v >= 0.0)
                            && part.chars().all(|c| c.is_ascii_digit() || c == '.')
                    } else {
                        part.chars().all(|c| c.is_ascii_digit())
                    }
            });

        if valid {
            Ok(())
        } else {
            Err(AppError::InvalidInput(format!("Invalid time: {} (expected HH:MM:SS)", value)))
        }
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let validator = InputValidator::new();
        assert!(validator.validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(validator.validate_url("http://example.org/video/1").is_ok());

        for bad in ["", "   ", "not a url", "ftp://example.com/file", "file:///etc/passwd", "https://"] {
            assert!(
                matches!(validator.validate_url(bad), Err(AppError::InvalidInput(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn destination_must_be_an_existing_directory() {
        let validator = InputValidator::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();

        assert!(validator.validate_destination_dir(dir.path()).is_ok());
        assert!(validator.validate_destination_dir(&file).is_err());
        assert!(validator.validate_destination_dir(&dir.path().join("missing")).is_err());
        assert!(validator.validate_destination_dir(Path::new("")).is_err());
    }

    #[test]
    fn timestamps() {
        let validator = InputValidator::new();
        for good in ["90", "01:30", "1:02:03", "00:00:10.5"] {
            assert!(validator.validate_timestamp(good).is_ok(), "{}", good);
        }
        for bad in ["", "1:2:3:4", "ab:cd", "-5", "01::02", "1:30x"] {
            assert!(validator.validate_timestamp(bad).is_err(), "{}", bad);
        }
    }
}
