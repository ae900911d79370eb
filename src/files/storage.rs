use std::path::PathBuf;
use anyhow::{bail, Context};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Where completely received files end up. This decouples the receiver from the file system
///  (and makes it possible to test it without one).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    /// `chunks` are in ascending sequence order
    async fn persist(&self, file_id: &str, chunks: Vec<String>) -> anyhow::Result<()>;
}

/// Writes each received file to `<dir>/<file_id>`, replacing previous content
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> DirectoryStorage {
        DirectoryStorage {
            dir: dir.into(),
        }
    }

    /// file ids come from the network - they must not be able to escape the target directory
    pub fn target_path(&self, file_id: &str) -> anyhow::Result<PathBuf> {
        if file_id.is_empty() || file_id == "." || file_id == ".." {
            bail!("file id {:?} is not a valid file name", file_id);
        }
        if file_id.contains(['/', '\\', '\0']) {
            bail!("file id {:?} contains a path separator", file_id);
        }
        Ok(self.dir.join(file_id))
    }
}

#[async_trait]
impl FileStorage for DirectoryStorage {
    async fn persist(&self, file_id: &str, chunks: Vec<String>) -> anyhow::Result<()> {
        let path = self.target_path(file_id)?;

        tokio::fs::create_dir_all(&self.dir).await
            .with_context(|| format!("creating download directory {:?}", self.dir))?;

        let mut file = tokio::fs::File::create(&path).await
            .with_context(|| format!("creating {:?}", path))?;

        let mut len = 0;
        for chunk in &chunks {
            file.write_all(chunk.as_bytes()).await?;
            len += chunk.len();
        }
        file.flush().await?;
        debug!("wrote {} chunks to {:?}", chunks.len(), path);
        info!("stored file {} ({} bytes) at {:?}", file_id, len, path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::dot(".")]
    #[case::dotdot("..")]
    #[case::slash("../etc/passwd")]
    #[case::backslash("a\\b")]
    fn test_target_path_rejects(#[case] file_id: &str) {
        assert!(DirectoryStorage::new("/tmp/x").target_path(file_id).is_err());
    }

    #[test]
    fn test_target_path() {
        let storage = DirectoryStorage::new("/tmp/downloads");
        assert_eq!(storage.target_path("001").unwrap(), PathBuf::from("/tmp/downloads/001"));
    }

    #[tokio::test]
    async fn test_persist_concatenates_chunks() {
        let dir = std::env::temp_dir().join(format!("rdt_share_storage_{}", std::process::id()));
        let storage = DirectoryStorage::new(&dir);

        storage.persist("001", vec!["AAAA".to_string(), "BBBB".to_string(), "CCCC".to_string()]).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(dir.join("001")).await.unwrap(), "AAAABBBBCCCC");

        // a second transfer of the same file replaces the content
        storage.persist("001", vec!["x".to_string()]).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(dir.join("001")).await.unwrap(), "x");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
