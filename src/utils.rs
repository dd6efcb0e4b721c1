use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use crate::errors::{AppError, Result};
use log::{debug, info};

pub const NONCE_LEN: usize = 12;

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a unique ID for jobs
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Deletes a temporary file or directory tree. Missing paths count as already
/// removed, so calling this twice is harmless. Returns whether anything was deleted.
pub async fn remove_artifact(path: &Path) -> std::io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            debug!("Removed artifact: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

const MAX_NAME_SUFFIX: u32 = 10_000;

/// Claims a name in `dir` that no other file uses: `name`, then `stem_1.ext`,
/// `stem_2.ext` and so on. The claim is an empty file created with
/// `create_new`, so two jobs can never end up with the same name; the caller
/// renames the real file over it.
pub async fn claim_unique_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let name_path = Path::new(name);
    let stem = name_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = name_path.extension().map(|e| e.to_string_lossy().into_owned());

    for counter in 0..MAX_NAME_SUFFIX {
        let candidate = match (counter, &extension) {
            (0, _) => dir.join(name),
            (n, Some(ext)) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            (n, None) => dir.join(format!("{}_{}", stem, n)),
        };
        let claim = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match claim {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(AppError::InvalidState(format!(
        "No free file name for {} in {}",
        name,
        dir.display()
    )))
}

/// Encrypts with AES-256-GCM under a fresh random nonce.
/// Returns `(nonce, ciphertext)`, both hex encoded.
pub fn encrypt_data(data: &[u8], key: &[u8]) -> Result<(String, String)> {
    use aes_gcm::aead::{Aead, AeadCore, OsRng};
    use aes_gcm::{Aes256Gcm, Key, KeyInit};

    if key.len() != 32 {
        return Err(AppError::Encryption(format!("Key must be 32 bytes, got {}", key.len())));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

    Ok((hex::encode(nonce), hex::encode(ciphertext)))
}

/// Decrypts data produced by [`encrypt_data`].
pub fn decrypt_data(nonce_hex: &str, encrypted_hex: &str, key: &[u8]) -> Result<Vec<u8>> {
    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

    if key.len() != 32 {
        return Err(AppError::Encryption(format!("Key must be 32 bytes, got {}", key.len())));
    }

    let nonce = hex::decode(nonce_hex)
        .map_err(|e| AppError::Encryption(format!("Hex decoding failed: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(AppError::Encryption(format!("Nonce must be {} bytes", NONCE_LEN)));
    }
    let ciphertext = hex::decode(encrypted_hex)
        .map_err(|e| AppError::Encryption(format!("Hex decoding failed: {}", e)))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| generate_download_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn nonce_differs_per_write() {
        let key = [7u8; 32];
        let (nonce_a, data_a) = encrypt_data(b"secret", &key).unwrap();
        let (nonce_b, data_b) = encrypt_data(b"secret", &key).unwrap();
        assert_ne!(nonce_a, nonce_b);
        assert_ne!(data_a, data_b);
        assert_eq!(decrypt_data(&nonce_a, &data_a, &key).unwrap(), b"secret");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let (nonce, data) = encrypt_data(b"secret", &[1u8; 32]).unwrap();
        assert!(matches!(decrypt_data(&nonce, &data, &[2u8; 32]), Err(AppError::Encryption(_))));
        assert!(decrypt_data("zz", &data, &[1u8; 32]).is_err());
    }

    #[tokio::test]
    async fn removing_artifacts_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4.part");
        let nested = dir.path().join(".vdl-1");
        std::fs::write(&file, b"partial").unwrap();
        std::fs::create_dir_all(nested.join("frags")).unwrap();
        std::fs::write(nested.join("frags").join("f1"), b"x").unwrap();

        assert!(remove_artifact(&file).await.unwrap());
        assert!(remove_artifact(&nested).await.unwrap());
        assert!(!remove_artifact(&file).await.unwrap());
        assert!(!remove_artifact(&nested).await.unwrap());
        assert!(!file.exists() && !nested.exists());
    }

    #[tokio::test]
    async fn taken_names_get_a_counter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"earlier").unwrap();
        std::fs::write(dir.path().join("clip_1.mp4"), b"earlier").unwrap();

        let claimed = claim_unique_path(dir.path(), "clip.mp4").await.unwrap();
        assert_eq!(claimed, dir.path().join("clip_2.mp4"));
        assert!(claimed.is_file());
        assert_eq!(std::fs::read(dir.path().join("clip.mp4")).unwrap(), b"earlier");

        let fresh = claim_unique_path(dir.path(), "other.webm").await.unwrap();
        assert_eq!(fresh, dir.path().join("other.webm"));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let claims = (0..8).map(|_| claim_unique_path(dir.path(), "clip.mp4"));
        let mut names: Vec<PathBuf> = futures::future::join_all(claims)
            .await
            .into_iter()
            .map(|claim| claim.unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }
}
