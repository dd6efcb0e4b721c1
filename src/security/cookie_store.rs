use crate::errors::{AppError, Result};
use crate::security::netscape::{self, Cookie};
use crate::utils::{decrypt_data, encrypt_data};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STORE_VERSION: u32 = 1;
const KEY_FILE: &str = "encryption.key";
const COOKIE_DIR: &str = "cookies";
const COOKIE_FILE: &str = "session.cookies";

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedData {
    version: u32,
    nonce: String,
    data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieStatus {
    pub count: usize,
    pub expired: usize,
    pub domains: Vec<String>,
}

/// Session cookies encrypted at rest with AES-256-GCM.
///
/// Shared behind a `tokio::sync::RwLock`: jobs only read, imports write.
pub struct CookieStore {
    storage_path: PathBuf,
    master_key: [u8; 32],
}

impl CookieStore {
    /// Opens the store under `data_dir`, creating the key on first use.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let cookie_dir = data_dir.join(COOKIE_DIR);
        std::fs::create_dir_all(&cookie_dir)?;

        let master_key = Self::get_or_create_master_key(data_dir)?;

        Ok(Self {
            storage_path: cookie_dir.join(COOKIE_FILE),
            master_key,
        })
    }

    fn get_or_create_master_key(data_dir: &Path) -> Result<[u8; 32]> {
        let key_path = data_dir.join(KEY_FILE);

        if key_path.exists() {
            let key_data = std::fs::read(&key_path)?;
            if key_data.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&key_data);
                return Ok(key);
            }
            log::warn!("[COOKIES] Encryption key has the wrong length; generating a new one");
        }
        Self::generate_master_key(&key_path)
    }

    fn generate_master_key(key_path: &Path) -> Result<[u8; 32]> {
        use rand::RngCore;

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(key_path, key)?;
        restrict_permissions(key_path);

        Ok(key)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Merges `cookies` into what is stored and writes the result back.
    /// Returns the number of cookies now stored.
    pub async fn save_cookies(&self, cookies: Vec<Cookie>) -> Result<usize> {
        let existing = self.load_cookies().await?;
        let merged = netscape::merge(existing, cookies);

        let text = netscape::serialize(&merged);
        let (nonce, data) = encrypt_data(text.as_bytes(), &self.master_key)?;
        let document = EncryptedData {
            version: STORE_VERSION,
            nonce,
            data,
        };

        let tmp_path = self.storage_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec(&document)?).await?;
        tokio::fs::rename(&tmp_path, &self.storage_path).await?;
        restrict_permissions(&self.storage_path);

        log::info!("[COOKIES] Stored {} cookie(s)", merged.len());
        Ok(merged.len())
    }

    /// Reads a Netscape cookies file and merges it into the store.
    pub async fn import_file(&self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path).await?;
        let cookies = netscape::parse(&text);
        if cookies.is_empty() {
            return Err(AppError::InvalidInput(format!("No cookies found in {}", path.display())));
        }
        self.save_cookies(cookies).await
    }

    /// Stored cookies, or none. A file that cannot be decrypted is deleted.
    pub async fn load_cookies(&self) -> Result<Vec<Cookie>> {
        let raw = match tokio::fs::read(&self.storage_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match self.decode(&raw) {
            Ok(cookies) => Ok(cookies),
            Err(e) => {
                log::warn!("[COOKIES] Discarding unreadable cookie store: {}", e);
                self.delete_cookies().await?;
                Ok(Vec::new())
            }
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Cookie>> {
        let document: EncryptedData = serde_json::from_slice(raw)?;
        if document.version != STORE_VERSION {
            return Err(AppError::Encryption(format!("Unsupported store version {}", document.version)));
        }
        let plain = decrypt_data(&document.nonce, &document.data, &self.master_key)?;
        let text = String::from_utf8(plain)
            .map_err(|e| AppError::Encryption(format!("UTF-8 conversion failed: {}", e)))?;
        Ok(netscape::parse(&text))
    }

    pub async fn delete_cookies(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.storage_path).await {
            Ok(()) => {
                log::info!("[COOKIES] Cookie store cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self) -> Result<CookieStatus> {
        let cookies = self.load_cookies().await?;
        let now = chrono::Utc::now().timestamp();

        let mut domains: Vec<String> = cookies
            .iter()
            .map(|c| c.domain.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        domains.sort();
        domains.dedup();

        Ok(CookieStatus {
            count: cookies.len(),
            expired: cookies.iter().filter(|c| c.is_expired(now)).count(),
            domains,
        })
    }

    /// Writes the stored cookies as a plain cookies file inside `dir` for one
    /// extractor run. `None` when nothing is stored. The caller owns the file.
    pub async fn export_for_job(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let cookies = self.load_cookies().await?;
        if cookies.is_empty() {
            return Ok(None);
        }

        let file = tempfile::Builder::new()
            .prefix("cookies-")
            .suffix(".txt")
            .tempfile_in(dir)?;
        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| AppError::Io(e.error))?;

        tokio::fs::write(&path, netscape::serialize(&cookies)).await?;
        restrict_permissions(&path);
        Ok(Some(path))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        log::warn!("[COOKIES] Could not restrict permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
