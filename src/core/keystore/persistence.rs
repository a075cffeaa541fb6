//! Write-then-rename persistence for the `KeyStore` (spec.md §4.8).
//!
//! The on-disk format is a JSON array of `[keyString, record]` pairs,
//! preserving the creation order the in-memory store tracks. Every save
//! writes to a sibling `<path>.tmp` file, flushes it, then renames it over
//! the real path — on POSIX filesystems `rename` is atomic, so a reader
//! (or a crash) never observes a half-written file.

use crate::core::key_record::ApiKeyRecord;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub async fn save(path: PathBuf, pairs: Vec<(String, ApiKeyRecord)>) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(&pairs)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let tmp_path = tmp_path_for(&path);
    {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}

/// Used by [`super::KeyStore::schedule_save`] when called from a non-async
/// context (e.g. a `Drop` impl); blocks the calling thread.
pub async fn save_sync_caller(path: PathBuf, pairs: Vec<(String, ApiKeyRecord)>) -> std::io::Result<()> {
    save(path, pairs).await
}

pub async fn load(path: &Path) -> std::io::Result<Vec<(String, ApiKeyRecord)>> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "keystore".to_string());
    name.push_str(".tmp");
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_record::KeyOptions;

    #[tokio::test]
    async fn round_trips_order_and_fields() {
        let dir = std::env::temp_dir().join(format!("metergate-test-{}", std::process::id()));
        let path = dir.join("keys.json");

        let pairs = vec![
            ("k1".to_string(), ApiKeyRecord::new("first".into(), 10, KeyOptions::default())),
            ("k2".to_string(), ApiKeyRecord::new("second".into(), 20, KeyOptions::default())),
        ];
        save(path.clone(), pairs.clone()).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "k1");
        assert_eq!(loaded[1].0, "k2");
        assert_eq!(loaded[0].1.credits, 10);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let path = std::env::temp_dir().join("metergate-does-not-exist-12345/keys.json");
        let loaded = load(&path).await.unwrap();
        assert!(loaded.is_empty());
    }
}
