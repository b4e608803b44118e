use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::upload_dir_capsule;

pub fn upload_store_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UploadStore> {
    let dir = get.as_ref(upload_dir_capsule).clone();
    Arc::new(LocalUploadStore { dir })
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Writes `bytes` under a freshly generated name that keeps the extension of
    /// `original_name`, and returns that name (not the full path).
    async fn save(&self, original_name: &str, bytes: &[u8]) -> anyhow::Result<String>;

    /// Removes a stored upload. Removing a file that is already gone succeeds.
    async fn remove(&self, file_name: &str) -> anyhow::Result<()>;
}

struct LocalUploadStore {
    dir: PathBuf,
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn save(&self, original_name: &str, bytes: &[u8]) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create upload dir {}", self.dir.display()))?;

        let file_name = unique_file_name(original_name);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write upload {}", path.display()))?;

        debug!(file_name, "Stored upload");
        Ok(file_name)
    }

    #[instrument(skip(self))]
    async fn remove(&self, file_name: &str) -> anyhow::Result<()> {
        // NOTE: stored names never contain separators, so a name that does is not ours
        let Some(file_name) = Path::new(file_name).file_name() else {
            return Ok(());
        };
        let path = self.dir.join(file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Upload already removed");
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove upload {}", path.display()))
            }
        }
    }
}

fn unique_file_name(original_name: &str) -> String {
    let id = Uuid::new_v4();
    let extension = Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}
