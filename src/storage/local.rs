use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use tokio::fs;

/// Object storage backed by a local directory. Objects are addressed by
/// slash-separated keys and published under `base_url`.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    base_url: String,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, base_url: String) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self { base_dir, base_url }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `data` at `key` and returns its public URL.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<String> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(self.get_public_url(key))
    }

    /// Returns whether an object was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every object under `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.resolve_path(prefix)?;
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_public_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!("{}/{key}", self.base_url)
    }

    /// Maps a key onto the storage root, refusing anything that could escape it.
    pub fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let key = validate_key(key)?;
        Ok(self.base_dir.join(Path::new(key)))
    }
}

pub fn validate_key(key: &str) -> Result<&str> {
    if key.is_empty() {
        return Err(anyhow!("storage key is empty"));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(anyhow!("storage key is not a relative path"));
    }
    let all_normal = Path::new(key)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !all_normal {
        return Err(anyhow!("storage key contains a disallowed path component"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempdir().unwrap();
        let storage = LocalFileStorage::new(
            dir.path().to_path_buf(),
            "http://localhost:3000/files/".to_string(),
        );
        let url = storage.put("results/abc/one.png", b"png").await.unwrap();
        assert_eq!(url, "http://localhost:3000/files/results/abc/one.png");
        assert_eq!(
            storage.get("results/abc/one.png").await.unwrap(),
            Some(b"png".to_vec())
        );
        assert!(storage.delete("results/abc/one.png").await.unwrap());
        assert!(!storage.delete("results/abc/one.png").await.unwrap());
        assert_eq!(storage.get("results/abc/one.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_prefix_removes_tree() {
        let dir = tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path().to_path_buf(), "http://x".to_string());
        storage.put("results/s1/a.png", b"a").await.unwrap();
        storage.put("results/s1/b.png", b"b").await.unwrap();
        storage.put("results/s2/c.png", b"c").await.unwrap();
        storage.delete_prefix("results/s1").await.unwrap();
        assert_eq!(storage.get("results/s1/a.png").await.unwrap(), None);
        assert_eq!(storage.get("results/s2/c.png").await.unwrap(), Some(b"c".to_vec()));
        storage.delete_prefix("results/missing").await.unwrap();
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in [
            "",
            "../etc/passwd",
            "results/../../secret",
            "/etc/passwd",
            "results\\..\\x",
            "./results/a.png",
            "a\0b",
        ] {
            assert!(validate_key(key).is_err(), "accepted {key:?}");
        }
        assert!(validate_key("results/abc/one.png").is_ok());
    }
}
