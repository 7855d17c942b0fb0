//! Cache negotiation: decide what to transmit and pack the bundle

use remote_analyze_orchestration::{BundleBuilder, BundleMetadata};
use remote_analyze_storage::Digest;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::hasher::HashedFiles;

/// A bundle ready for `analyze`
#[derive(Debug)]
pub struct PreparedBundle {
    pub bytes: Vec<u8>,
    /// Files carried in the bundle
    pub uploaded: usize,
    /// Files the server resolves from its cache
    pub cached: usize,
}

/// Pack every file whose digest is in `missing`; list the rest as cached
///
/// A missing file that can no longer be read is dropped with a warning.
pub fn prepare_bundle(
    hashed: &HashedFiles,
    missing: &BTreeSet<Digest>,
    build_command: &str,
    source: &Path,
) -> ClientResult<PreparedBundle> {
    let mut builder = BundleBuilder::new();
    let mut cached_files = BTreeMap::new();

    for file in hashed.iter() {
        if !missing.contains(&file.digest) {
            cached_files.insert(file.digest.clone(), file.path.to_string_lossy().into_owned());
            continue;
        }
        match builder.add_file_from_disk(&file.path) {
            Ok(_) => {}
            Err(remote_analyze_orchestration::OrchestratorError::Io(e)) => {
                warn!("Dropping {} from the bundle: {}", file.path.display(), e);
            }
            Err(e) => return Err(ClientError::Bundle(e.to_string())),
        }
    }

    let uploaded = builder.len();
    let cached = cached_files.len();
    let metadata = BundleMetadata {
        build_command: build_command.to_string(),
        file_path: source.to_string_lossy().into_owned(),
        cached_files,
    };
    let bytes = builder.finish(&metadata)?;
    debug!(
        "Prepared bundle for {}: {} uploaded, {} cached, {} bytes",
        source.display(),
        uploaded,
        cached,
        bytes.len()
    );

    Ok(PreparedBundle {
        bytes,
        uploaded,
        cached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_files;
    use remote_analyze_orchestration::{Bundle, BundleLimits};
    use tempfile::TempDir;

    #[test]
    fn test_only_missing_files_are_packed() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("main.c");
        let header = dir.path().join("util.h");
        std::fs::write(&source, "#include \"util.h\"\n").unwrap();
        std::fs::write(&header, "int util(void);\n").unwrap();

        let hashed = hash_files(&[source.clone(), header.clone()]);
        let header_digest = Digest::from_file(&header).unwrap();
        let missing = BTreeSet::from([Digest::from_file(&source).unwrap()]);

        let prepared = prepare_bundle(&hashed, &missing, "gcc -c", &source).unwrap();
        assert_eq!(prepared.uploaded, 1);
        assert_eq!(prepared.cached, 1);

        let bundle = Bundle::parse(&prepared.bytes, BundleLimits::default()).unwrap();
        assert_eq!(bundle.files.len(), 1);
        assert_eq!(bundle.files[0].bytes, b"#include \"util.h\"\n");
        assert_eq!(bundle.metadata.build_command, "gcc -c");
        assert_eq!(bundle.metadata.file_path, source.to_string_lossy());
        assert_eq!(
            bundle.metadata.cached_files,
            BTreeMap::from([(header_digest, header.to_string_lossy().into_owned())])
        );
    }

    #[test]
    fn test_vanished_file_is_dropped() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("main.c");
        let header = dir.path().join("gone.h");
        std::fs::write(&source, "int main;").unwrap();
        std::fs::write(&header, "gone").unwrap();

        let hashed = hash_files(&[source.clone(), header.clone()]);
        std::fs::remove_file(&header).unwrap();
        let missing: BTreeSet<Digest> = hashed.digests().into_iter().collect();

        let prepared = prepare_bundle(&hashed, &missing, "gcc -c", &source).unwrap();
        assert_eq!(prepared.uploaded, 1);
        assert_eq!(prepared.cached, 0);
    }
}
