//! Filesystem credential backend.
//!
//! Layout: `<root>/<provider>/<base64url(identity)>.{json,enc}`. Directories
//! are created `0700` and files `0600` on Unix; every write goes to a
//! temporary sibling that is renamed over the target.

use crate::crypto::Sealer;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use keygate_types::{Credential, CredentialBackend, GatewayError, ProviderId, Result};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::io::AsyncWriteExt as _;

/// Stores one file per credential, optionally AES-GCM sealed.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    sealer: Option<Sealer>,
}

impl FileBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Passing `None` for `sealer` stores plain JSON protected only by file
    /// permissions.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>, sealer: Option<Sealer>) -> Result<Self> {
        let root = root.into();
        create_private_dir(&root).await?;
        Ok(Self { root, sealer })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }

    fn extension(&self) -> &'static str {
        if self.sealer.is_some() { "enc" } else { "json" }
    }

    /// Path of the record for `(provider, identity)`.
    #[must_use]
    pub fn path_for(&self, provider: &ProviderId, identity: &str) -> PathBuf {
        self.root.join(provider.as_str()).join(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(identity.as_bytes()),
            self.extension()
        ))
    }

    fn corrupt(provider: &ProviderId, identity: &str, reason: impl Into<String>) -> GatewayError {
        GatewayError::CorruptCredential {
            provider: provider.clone(),
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CredentialBackend for FileBackend {
    async fn load(&self, provider: &ProviderId, identity: &str) -> Result<Credential> {
        let path = self.path_for(provider, identity);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::CredentialNotFound {
                    provider: provider.clone(),
                    identity: identity.to_string(),
                });
            }
            Err(e) => {
                return Err(GatewayError::Storage(format!("read {}: {e}", path.display())));
            }
        };
        let plain = match &self.sealer {
            Some(sealer) => sealer
                .open(&raw)
                .map_err(|reason| Self::corrupt(provider, identity, reason))?,
            None => raw,
        };
        let credential: Credential = serde_json::from_slice(&plain)
            .map_err(|e| Self::corrupt(provider, identity, format!("invalid record: {e}")))?;
        if &credential.provider != provider || credential.identity != identity {
            return Err(Self::corrupt(
                provider,
                identity,
                format!("record belongs to {}", credential.reference()),
            ));
        }
        Ok(credential)
    }

    async fn store(&self, credential: &Credential) -> Result<()> {
        credential.validate()?;
        let path = self.path_for(&credential.provider, &credential.identity);
        if let Some(dir) = path.parent() {
            create_private_dir(dir).await?;
        }
        let json = serde_json::to_vec(credential)?;
        let bytes = match &self.sealer {
            Some(sealer) => sealer.seal(&json)?,
            None => json,
        };
        write_atomic(&path, &bytes).await
    }

    async fn remove(&self, provider: &ProviderId, identity: &str) -> Result<()> {
        let path = self.path_for(provider, identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Storage(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }

    async fn identities(&self, provider: &ProviderId) -> Result<Vec<String>> {
        let dir = self.root.join(provider.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GatewayError::Storage(format!("list {}: {e}", dir.display())));
            }
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GatewayError::Storage(format!("list {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension()) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match URL_SAFE_NO_PAD
                .decode(stem)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
            {
                Some(identity) => out.push(identity),
                None => tracing::warn!(file = %path.display(), "skipping unrecognised credential file"),
            }
        }
        out.sort();
        Ok(out)
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| GatewayError::Storage(format!("create {}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| GatewayError::Storage(format!("chmod {}: {e}", dir.display())))?;
    }
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GatewayError::Storage(format!("bad path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    let storage = |e: std::io::Error| GatewayError::Storage(format!("write {}: {e}", path.display()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let result = async {
        let mut file = options.open(&tmp).await.map_err(storage)?;
        file.write_all(bytes).await.map_err(storage)?;
        file.sync_all().await.map_err(storage)?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(storage)
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_types::unix_now;

    fn oauth(identity: &str, token: &str) -> Credential {
        Credential::oauth_pair(
            ProviderId::claude(),
            identity,
            token,
            Some("rt".into()),
            unix_now() + 3600,
            None,
        )
    }

    async fn backend(dir: &Path, encrypted: bool) -> FileBackend {
        let sealer = encrypted.then(|| Sealer::from_hex(&Sealer::generate_key()).unwrap());
        FileBackend::open(dir, sealer).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_load_plain() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        b.store(&oauth("u@e.com", "tok1")).await.unwrap();
        let loaded = b.load(&ProviderId::claude(), "u@e.com").await.unwrap();
        assert_eq!(loaded.access_token(), "tok1");
        let path = b.path_for(&ProviderId::claude(), "u@e.com");
        assert_eq!(path.extension().unwrap(), "json");
    }

    #[tokio::test]
    async fn test_store_and_load_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), true).await;
        b.store(&oauth("u@e.com", "tok1")).await.unwrap();
        let path = b.path_for(&ProviderId::claude(), "u@e.com");
        let raw = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("tok1"));
        let loaded = b.load(&ProviderId::claude(), "u@e.com").await.unwrap();
        assert_eq!(loaded.access_token(), "tok1");
    }

    #[tokio::test]
    async fn test_flipped_byte_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), true).await;
        b.store(&oauth("u@e.com", "tok1")).await.unwrap();
        let path = b.path_for(&ProviderId::claude(), "u@e.com");
        let mut raw = std::fs::read(&path).unwrap();
        raw[20] ^= 0xff;
        std::fs::write(&path, raw).unwrap();
        let err = b.load(&ProviderId::claude(), "u@e.com").await.unwrap_err();
        assert!(matches!(err, GatewayError::CorruptCredential { .. }));
    }

    #[tokio::test]
    async fn test_garbled_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        b.store(&oauth("a", "tok")).await.unwrap();
        std::fs::write(b.path_for(&ProviderId::claude(), "a"), b"{not json").unwrap();
        let err = b.load(&ProviderId::claude(), "a").await.unwrap_err();
        assert!(matches!(err, GatewayError::CorruptCredential { .. }));
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        let err = b.load(&ProviderId::claude(), "nobody").await.unwrap_err();
        assert!(matches!(err, GatewayError::CredentialNotFound { .. }));
    }

    #[tokio::test]
    async fn test_identity_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        let evil = "../../etc/passwd";
        b.store(&oauth(evil, "tok")).await.unwrap();
        let path = b.path_for(&ProviderId::claude(), evil);
        assert!(path.starts_with(dir.path().join("claude")));
        assert_eq!(b.identities(&ProviderId::claude()).await.unwrap(), vec![evil]);
    }

    #[tokio::test]
    async fn test_identities_sorted_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        b.store(&oauth("b@e.com", "t")).await.unwrap();
        b.store(&oauth("a@e.com", "t")).await.unwrap();
        assert_eq!(
            b.identities(&ProviderId::claude()).await.unwrap(),
            vec!["a@e.com", "b@e.com"]
        );
        b.remove(&ProviderId::claude(), "a@e.com").await.unwrap();
        b.remove(&ProviderId::claude(), "a@e.com").await.unwrap();
        assert_eq!(b.identities(&ProviderId::claude()).await.unwrap(), vec!["b@e.com"]);
        assert!(
            b.identities(&ProviderId::new("other").unwrap())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_record() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        let err = b.store(&oauth("a", "")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir.path().join("store"), true).await;
        b.store(&oauth("a", "tok")).await.unwrap();
        let file_mode = std::fs::metadata(b.path_for(&ProviderId::claude(), "a"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("store").join("claude"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), false).await;
        b.store(&oauth("a", "tok1")).await.unwrap();
        b.store(&oauth("a", "tok2")).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path().join("claude"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
