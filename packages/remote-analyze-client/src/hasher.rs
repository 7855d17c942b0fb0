//! Content hashing of dependency files

use rayon::prelude::*;
use remote_analyze_storage::Digest;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A dependency file and its content digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub digest: Digest,
    pub path: PathBuf,
}

/// Digest → path, in input order, one entry per distinct digest
#[derive(Debug, Clone, Default)]
pub struct HashedFiles {
    files: Vec<HashedFile>,
}

impl HashedFiles {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashedFile> {
        self.files.iter()
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.files.iter().map(|f| f.digest.clone()).collect()
    }

    pub fn path_of(&self, digest: &Digest) -> Option<&Path> {
        self.files
            .iter()
            .find(|f| &f.digest == digest)
            .map(|f| f.path.as_path())
    }
}

/// Hash every path in parallel
///
/// Unreadable files are dropped with a warning. When two paths have the same
/// content, the one earlier in `paths` wins.
pub fn hash_files(paths: &[PathBuf]) -> HashedFiles {
    let hashed: Vec<Option<HashedFile>> = paths
        .par_iter()
        .map(|path| match Digest::from_file(path) {
            Ok(digest) => Some(HashedFile {
                digest,
                path: path.clone(),
            }),
            Err(e) => {
                warn!("Skipping unreadable dependency {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    let mut seen = HashSet::new();
    let files = hashed
        .into_iter()
        .flatten()
        .filter(|file| seen.insert(file.digest.clone()))
        .collect();

    HashedFiles { files }
}
