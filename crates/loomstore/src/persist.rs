//! Atomic JSON persistence: serialize to a sibling temp file, then
//! rename over the target. A crash mid-write leaves the previous
//! document intact; readers never observe a partial file.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub(crate) async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Missing file reads as `None`; a corrupt document is an error rather
/// than silent data loss.
pub(crate) async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        save_json(&path, &json!({"k": 1})).await.unwrap();
        let loaded: Option<serde_json::Value> = load_json(&path).await.unwrap();
        assert_eq!(loaded, Some(json!({"k": 1})));
        assert!(!dir.path().join("data.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<serde_json::Value> =
            load_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        save_json(&path, &json!([1, 2, 3])).await.unwrap();
        save_json(&path, &json!([4])).await.unwrap();
        let loaded: Option<serde_json::Value> = load_json(&path).await.unwrap();
        assert_eq!(loaded, Some(json!([4])));
    }
}
