use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

/// A JSON array on disk guarded by a single mutex.
///
/// Every read and write takes the lock, so callers see a consistent file.
/// Writes go to a sibling temp file which is then renamed over the original.
/// A missing file reads as an empty list.
pub struct JsonFile<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFile {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub async fn read_all(&self) -> AppResult<Vec<T>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Load, apply `change`, and persist. Nothing is written if `change` fails.
    pub async fn update<R, F>(&self, change: F) -> AppResult<R>
    where
        F: FnOnce(&mut Vec<T>) -> AppResult<R>,
    {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;
        let result = change(&mut items)?;
        self.save(&items).await?;
        Ok(result)
    }

    async fn load(&self) -> AppResult<Vec<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    async fn save(&self, items: &[T]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AppError::Storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let data = serde_json::to_vec_pretty(items)
            .map_err(|e| AppError::Storage(format!("Failed to serialize records: {}", e)))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &data).await.map_err(|e| {
            AppError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to move {} into place: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<String> = JsonFile::new(dir.path().join("nope.json"));
        assert!(file.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_change_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<String> = JsonFile::new(dir.path().join("nested/items.json"));

        file.update(|items| {
            items.push("first".to_string());
            Ok(())
        })
        .await
        .unwrap();

        let result: AppResult<()> = file
            .update(|items| {
                items.push("second".to_string());
                Err(AppError::Conflict("nope".to_string()))
            })
            .await;
        assert!(result.is_err());

        assert_eq!(file.read_all().await.unwrap(), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let file: JsonFile<String> = JsonFile::new(path);
        assert!(matches!(
            file.read_all().await,
            Err(AppError::Storage(_))
        ));
    }
}
