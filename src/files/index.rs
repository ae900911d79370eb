use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info};

use crate::error::RdtError;

/// Pseudo file id under which a peer's index is sent in reply to an index request. It is
///  reserved, i.e. no shared file can use it.
pub const INDEX_FILE_ID: &str = "index";
const ENTRY_SEPARATOR: char = '\n';

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IndexEntry {
    pub file_id: String,
    pub file_name: String,
}

/// The set of files this peer offers to others
#[cfg_attr(test, automock)]
pub trait FileIndex: Send + Sync + 'static {
    fn lookup_path(&self, file_id: &str) -> Option<PathBuf>;

    fn entries(&self) -> Vec<IndexEntry>;
}

#[derive(Debug, Default)]
pub struct SharedFileIndex {
    files: RwLock<BTreeMap<String, PathBuf>>,
}

impl SharedFileIndex {
    pub fn new() -> SharedFileIndex {
        Default::default()
    }

    /// Index all regular files in a directory, assigning ids `001`, `002`, ... in the order of
    ///  their file names
    pub async fn scan_directory(dir: impl AsRef<Path>) -> anyhow::Result<SharedFileIndex> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();

        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let index = SharedFileIndex::new();
        for (i, path) in paths.into_iter().enumerate() {
            index.add(&format!("{:03}", i+1), path)?;
        }
        info!("indexed {} files in {:?}", index.len(), dir);
        Ok(index)
    }

    pub fn add(&self, file_id: &str, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        Self::check_file_id(file_id)?;

        let path = path.into();
        debug!("sharing {:?} as file {}", path, file_id);
        self.files.write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id.to_string(), path);
        Ok(())
    }

    pub fn remove(&self, file_id: &str) -> Option<PathBuf> {
        self.files.write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_id)
    }

    pub fn len(&self) -> usize {
        self.files.read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// file ids go into control messages and index replies verbatim, so they must not contain
    ///  any of the separators used there
    fn check_file_id(file_id: &str) -> anyhow::Result<()> {
        if file_id.is_empty() {
            bail!("file id must not be empty");
        }
        if file_id == INDEX_FILE_ID {
            bail!("file id {:?} is reserved", INDEX_FILE_ID);
        }
        if file_id.contains([',', ':', ENTRY_SEPARATOR]) {
            bail!("file id {:?} contains a separator character", file_id);
        }
        if file_id.trim() != file_id {
            bail!("file id {:?} has surrounding whitespace", file_id);
        }
        Ok(())
    }
}

impl FileIndex for SharedFileIndex {
    fn lookup_path(&self, file_id: &str) -> Option<PathBuf> {
        self.files.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .cloned()
    }

    fn entries(&self) -> Vec<IndexEntry> {
        self.files.read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(file_id, path)| IndexEntry {
                file_id: file_id.clone(),
                file_name: path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            })
            .collect()
    }
}

/// `file_id:file_name` pairs, one per line
pub fn render_index(entries: &[IndexEntry]) -> String {
    entries.iter()
        .map(|e| format!("{}:{}", e.file_id, e.file_name))
        .collect::<Vec<_>>()
        .join(&ENTRY_SEPARATOR.to_string())
}

pub fn parse_index(text: &str) -> Result<Vec<IndexEntry>, RdtError> {
    text.split(ENTRY_SEPARATOR)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (file_id, file_name) = line.split_once(':')
                .ok_or_else(|| RdtError::format(format!("index entry without ':' - {:?}", line)))?;
            Ok(IndexEntry {
                file_id: file_id.to_string(),
                file_name: file_name.to_string(),
            })
        })
        .collect()
}
