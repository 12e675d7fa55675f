//! An evidence store backed by a local directory.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::debug;
use tokio::task::block_in_place;

use super::{EvidenceMetadata, EvidenceStore};
use crate::error::StorageError;

const METADATA_SUFFIX: &str = ".meta.json";

pub struct LocalEvidenceStore {
    root: PathBuf,
    base_url: String,
}

impl LocalEvidenceStore {
    /// Files are written below `root` and served as `<base_url>/<path>`.
    pub fn new<P: AsRef<Path>>(root: P, base_url: &str) -> Self {
        LocalEvidenceStore {
            root: root.as_ref().to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let is_safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn path_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(&self.base_url)?.strip_prefix('/')
    }
}

fn metadata_file(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

impl EvidenceStore for LocalEvidenceStore {
    fn store(
        &self,
        bytes: &[u8],
        path: &str,
        metadata: &EvidenceMetadata,
    ) -> Result<String, StorageError> {
        let file = self.resolve(path)?;
        let fn_impl = || -> io::Result<()> {
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file, bytes)?;
            let sidecar = serde_json::to_vec_pretty(metadata)?;
            fs::write(metadata_file(&file), sidecar)?;
            Ok(())
        };

        block_in_place(fn_impl).map_err(|cause| StorageError::Store {
            path: path.to_string(),
            cause,
        })?;

        debug!("Stored {} bytes of evidence at {path}", bytes.len());
        Ok(format!("{}/{path}", self.base_url))
    }

    fn delete(&self, url: &str) -> Result<bool, StorageError> {
        let path = match self.path_of(url) {
            Some(path) => path,
            None => return Ok(false),
        };
        let file = self.resolve(path)?;

        let fn_impl = || -> io::Result<bool> {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            }
            match fs::remove_file(metadata_file(&file)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e),
            }
        };

        block_in_place(fn_impl).map_err(|cause| StorageError::Delete {
            url: url.to_string(),
            cause,
        })
    }
}
