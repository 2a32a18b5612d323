use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use tracing::debug;

use super::{BlockStore, StreamStatus};
use crate::error::{Error, Result};

const PARTIAL_SUFFIX: &str = "partial";

/// Blocks kept as plain files in one directory
#[derive(Debug, Clone)]
pub struct LocalBlockStore {
    root: PathBuf,
}

impl LocalBlockStore {
    /// Open (creating if needed) the store at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| Error::IoWrite {
            path: root.clone(),
            source,
        })?;
        debug!(root = %root.display(), "Block store opened");
        Ok(Self { root })
    }

    fn marker_for(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_name_for(id), PARTIAL_SUFFIX))
    }
}

/// Reference ids may contain path separators; blocks never nest.
fn file_name_for(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{}", name),
        _ => name,
    }
}

impl BlockStore for LocalBlockStore {
    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(file_name_for(id))
    }

    fn write(&self, id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(id);
        fs::write(&path, bytes).map_err(|source| Error::IoWrite {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn begin(&self, id: &str) -> Result<(PathBuf, File)> {
        let path = self.path_for(id);
        let marker = self.marker_for(id);
        File::create(&marker).map_err(|source| Error::IoWrite {
            path: marker.clone(),
            source,
        })?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::IoWrite {
                path: path.clone(),
                source,
            })?;
        Ok((path, file))
    }

    fn finish(&self, id: &str) -> Result<u64> {
        let path = self.path_for(id);
        let size = fs::metadata(&path)
            .map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?
            .len();
        let marker = self.marker_for(id);
        if marker.exists() {
            fs::remove_file(&marker).map_err(|source| Error::IoWrite {
                path: marker,
                source,
            })?;
        }
        Ok(size)
    }

    fn stream_status(&self, id: &str) -> Option<StreamStatus> {
        let metadata = fs::metadata(self.path_for(id)).ok()?;
        Some(StreamStatus {
            size: metadata.len(),
            done: !self.marker_for(id).exists(),
        })
    }
}

#[cfg(test)]
impl LocalBlockStore {
    /// Append to a block that is still being written
    pub fn append(&self, id: &str, bytes: &[u8]) -> Result<()> {
        use std::io::Write;

        let path = self.path_for(id);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| Error::IoWrite {
                path: path.clone(),
                source,
            })?;
        file.write_all(bytes)
            .map_err(|source| Error::IoWrite { path, source })
    }
}
