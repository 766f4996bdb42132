//! Local directory sink for development

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::object_store::ObjectSink;
use crate::error::{Error, Result};

/// Stores objects as files under a root directory
pub struct FilesystemSink {
    name: String,
    root: PathBuf,
}

impl FilesystemSink {
    /// Create the sink, creating `root` if needed
    pub fn new(name: &str, root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    /// Resolve a key to a path inside the root
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::validation(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectSink for FilesystemSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial object
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(sink = %self.name, path = %path.display(), size = bytes.len(), "Stored object");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.root).await.map(|m| m.is_dir()).unwrap_or(false))
    }
}
