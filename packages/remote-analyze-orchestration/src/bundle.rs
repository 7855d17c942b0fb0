//! Source bundle: the zip archive one submission carries
//!
//! # Entry layout
//!
//! ```text
//! sources-root/<path with leading separators stripped>   transmitted file
//! sources-root/build_command                             compile command
//! sources-root/file_path                                 compiled source file
//! sources-root/cached_files                              {"<digest>": "<path>"}
//! ```
//!
//! Entries use a fixed timestamp and `cached_files` is a sorted map, so the
//! metadata entries are byte-identical for identical inputs.

use remote_analyze_storage::Digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{OrchestratorError, Result};

pub const SOURCES_ROOT: &str = "sources-root";
pub const BUILD_COMMAND_ENTRY: &str = "sources-root/build_command";
pub const FILE_PATH_ENTRY: &str = "sources-root/file_path";
pub const CACHED_FILES_ENTRY: &str = "sources-root/cached_files";

const METADATA_ENTRIES: [&str; 3] = [BUILD_COMMAND_ENTRY, FILE_PATH_ENTRY, CACHED_FILES_ENTRY];

const MAX_BUNDLE_ENTRIES: usize = 100_000;
const MAX_ENTRY_UNCOMPRESSED_BYTES: u64 = 256 * 1024 * 1024;
const MAX_TOTAL_UNCOMPRESSED_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_COMPRESSION_RATIO: u64 = 200;

/// Relative path of `path` below `sources-root/`
///
/// Leading separators (and any drive prefix) are stripped. Returns `None` for
/// paths that would escape the root or are empty.
pub fn relative_name_for(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return None,
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Archive entry name of a transmitted file
pub fn entry_name_for(path: &Path) -> Option<String> {
    relative_name_for(path).map(|relative| format!("{}/{}", SOURCES_ROOT, relative))
}

/// Job metadata carried next to the sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Compile command without the source file argument
    pub build_command: String,
    /// The source file the command compiles
    pub file_path: String,
    /// Files the client did not transmit because the server already has them
    pub cached_files: BTreeMap<Digest, String>,
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
}

/// Builds a bundle in memory
pub struct BundleBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    seen: HashSet<String>,
}

impl Default for BundleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            seen: HashSet::new(),
        }
    }

    /// Number of transmitted files added so far
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Add a transmitted file under its original path
    ///
    /// Returns `false` when the entry was skipped: a duplicate of an earlier
    /// entry, a path that maps onto a metadata entry, or an unusable path.
    pub fn add_file(&mut self, path: &Path, bytes: &[u8]) -> Result<bool> {
        let Some(name) = entry_name_for(path) else {
            warn!("Skipping file with unusable path: {}", path.display());
            return Ok(false);
        };
        if METADATA_ENTRIES.contains(&name.as_str()) {
            warn!("Skipping file that collides with bundle metadata: {}", path.display());
            return Ok(false);
        }
        if !self.seen.insert(name.clone()) {
            return Ok(false);
        }

        self.writer.start_file(name, file_options())?;
        self.writer.write_all(bytes)?;
        Ok(true)
    }

    /// Read `path` from disk and add it
    pub fn add_file_from_disk(&mut self, path: &Path) -> Result<bool> {
        let bytes = std::fs::read(path)?;
        self.add_file(path, &bytes)
    }

    /// Write the metadata entries and return the archive bytes
    pub fn finish(mut self, metadata: &BundleMetadata) -> Result<Vec<u8>> {
        let cached = serde_json::to_vec(&metadata.cached_files)
            .map_err(OrchestratorError::serialization)?;

        self.writer.start_file(BUILD_COMMAND_ENTRY, file_options())?;
        self.writer.write_all(metadata.build_command.as_bytes())?;
        self.writer.start_file(FILE_PATH_ENTRY, file_options())?;
        self.writer.write_all(metadata.file_path.as_bytes())?;
        self.writer.start_file(CACHED_FILES_ENTRY, file_options())?;
        self.writer.write_all(&cached)?;

        Ok(self.writer.finish()?.into_inner())
    }
}

/// Limits applied when reading an untrusted bundle
#[derive(Debug, Clone, Copy)]
pub struct BundleLimits {
    pub max_entries: usize,
    pub max_entry_uncompressed_bytes: u64,
    pub max_total_uncompressed_bytes: u64,
    pub max_compression_ratio: u64,
}

impl Default for BundleLimits {
    fn default() -> Self {
        Self {
            max_entries: MAX_BUNDLE_ENTRIES,
            max_entry_uncompressed_bytes: MAX_ENTRY_UNCOMPRESSED_BYTES,
            max_total_uncompressed_bytes: MAX_TOTAL_UNCOMPRESSED_BYTES,
            max_compression_ratio: MAX_COMPRESSION_RATIO,
        }
    }
}

/// A transmitted file read back from a bundle
#[derive(Debug, Clone)]
pub struct BundleFile {
    /// Path below `sources-root/`
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

impl BundleFile {
    pub fn digest(&self) -> Digest {
        Digest::compute(&self.bytes)
    }
}

/// A parsed, validated bundle
#[derive(Debug, Clone)]
pub struct Bundle {
    pub metadata: BundleMetadata,
    pub files: Vec<BundleFile>,
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidBundle(message.into())
}

fn read_utf8(bytes: Vec<u8>, entry: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| invalid(format!("{} is not UTF-8", entry)))
}

impl Bundle {
    /// Parse and validate bundle bytes
    pub fn parse(bytes: &[u8], limits: BundleLimits) -> Result<Self> {
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|e| invalid(format!("not a zip: {}", e)))?;

        let entry_count = archive.len();
        if entry_count > limits.max_entries {
            return Err(invalid(format!(
                "{} entries, limit is {}",
                entry_count, limits.max_entries
            )));
        }

        let prefix = format!("{}/", SOURCES_ROOT);
        let mut build_command = None;
        let mut file_path = None;
        let mut cached_files = BTreeMap::new();
        let mut files = Vec::new();
        let mut total_uncompressed: u64 = 0;

        for i in 0..entry_count {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let size = entry.size();
            if size > limits.max_entry_uncompressed_bytes {
                return Err(invalid(format!(
                    "entry '{}' is too large ({} bytes, limit {})",
                    name, size, limits.max_entry_uncompressed_bytes
                )));
            }
            if size > 0 {
                let compressed = entry.compressed_size();
                if compressed == 0
                    || size > compressed.saturating_mul(limits.max_compression_ratio)
                {
                    return Err(invalid(format!(
                        "entry '{}' exceeds compression ratio limit",
                        name
                    )));
                }
            }
            total_uncompressed = total_uncompressed
                .checked_add(size)
                .ok_or_else(|| invalid("size overflow"))?;
            if total_uncompressed > limits.max_total_uncompressed_bytes {
                return Err(invalid(format!(
                    "extracted size {} exceeds limit {}",
                    total_uncompressed, limits.max_total_uncompressed_bytes
                )));
            }

            let Some(relative) = name.strip_prefix(&prefix) else {
                return Err(invalid(format!("entry '{}' is outside {}", name, SOURCES_ROOT)));
            };
            let relative = relative.to_string();

            let mut content = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut content)?;

            match name.as_str() {
                BUILD_COMMAND_ENTRY => build_command = Some(read_utf8(content, &name)?),
                FILE_PATH_ENTRY => file_path = Some(read_utf8(content, &name)?),
                CACHED_FILES_ENTRY => {
                    cached_files = serde_json::from_slice(&content)
                        .map_err(|e| invalid(format!("cached_files: {}", e)))?;
                }
                _ => {
                    let safe = entry.enclosed_name().is_some()
                        && relative_name_for(Path::new(&relative)).is_some();
                    if !safe {
                        return Err(invalid(format!("unsafe entry path '{}'", name)));
                    }
                    files.push(BundleFile {
                        relative_path: relative,
                        bytes: content,
                    });
                }
            }
        }

        let build_command = build_command.ok_or_else(|| invalid("missing build_command"))?;
        let file_path = file_path.ok_or_else(|| invalid("missing file_path"))?;

        Ok(Self {
            metadata: BundleMetadata {
                build_command,
                file_path,
                cached_files,
            },
            files,
        })
    }

    /// Write the transmitted files below `dest`, mirroring their original paths
    pub fn write_sources(&self, dest: &Path) -> Result<()> {
        for file in &self.files {
            let target = dest.join(&file.relative_path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &file.bytes)?;
        }
        Ok(())
    }

    /// Where a file with original path `original` lands below `dest`
    pub fn resolve(dest: &Path, original: &str) -> Option<PathBuf> {
        relative_name_for(Path::new(original)).map(|relative| dest.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata(cached: &[(&[u8], &str)]) -> BundleMetadata {
        BundleMetadata {
            build_command: "gcc -c -Iinclude".to_string(),
            file_path: "/src/main.c".to_string(),
            cached_files: cached
                .iter()
                .map(|(bytes, path)| (Digest::compute(bytes), path.to_string()))
                .collect(),
        }
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn test_entry_name_strips_leading_separators() {
        assert_eq!(
            entry_name_for(Path::new("/usr/include/stdio.h")).as_deref(),
            Some("sources-root/usr/include/stdio.h")
        );
        assert_eq!(
            entry_name_for(Path::new("src/./a.h")).as_deref(),
            Some("sources-root/src/a.h")
        );
        assert_eq!(entry_name_for(Path::new("/a/../b.h")), None);
        assert_eq!(entry_name_for(Path::new("/")), None);
    }

    #[test]
    fn test_builder_skips_duplicates_and_reserved_names() {
        let mut builder = BundleBuilder::new();
        assert!(builder.add_file(Path::new("/a.h"), b"a").unwrap());
        assert!(!builder.add_file(Path::new("//a.h"), b"a again").unwrap());
        assert!(!builder.add_file(Path::new("/build_command"), b"x").unwrap());
        assert_eq!(builder.len(), 1);

        let bytes = builder.finish(&metadata(&[])).unwrap();
        let names = entry_names(&bytes);
        assert_eq!(
            names.iter().filter(|n| n.as_str() == "sources-root/a.h").count(),
            1
        );
        assert!(names.contains(&BUILD_COMMAND_ENTRY.to_string()));
        assert!(names.contains(&FILE_PATH_ENTRY.to_string()));
        assert!(names.contains(&CACHED_FILES_ENTRY.to_string()));
    }

    #[test]
    fn test_bundle_parse_reads_metadata_and_files() {
        let mut builder = BundleBuilder::new();
        builder.add_file(Path::new("/src/main.c"), b"int main;").unwrap();
        builder.add_file(Path::new("/src/c.h"), b"#define C").unwrap();
        let meta = metadata(&[(b"a", "/src/a.h")]);
        let bytes = builder.finish(&meta).unwrap();

        let bundle = Bundle::parse(&bytes, BundleLimits::default()).unwrap();
        assert_eq!(bundle.metadata, meta);
        assert_eq!(bundle.files.len(), 2);
        assert_eq!(bundle.files[1].relative_path, "src/c.h");
        assert_eq!(bundle.files[1].digest(), Digest::compute(b"#define C"));
    }

    #[test]
    fn test_metadata_is_deterministic() {
        let build = || {
            let mut builder = BundleBuilder::new();
            builder.add_file(Path::new("/src/main.c"), b"int main;").unwrap();
            builder
                .finish(&metadata(&[(b"b", "/b.h"), (b"a", "/a.h")]))
                .unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_cached_files_keys_sorted() {
        let bytes = BundleBuilder::new()
            .finish(&metadata(&[(b"x", "/x.h"), (b"y", "/y.h"), (b"z", "/z.h")]))
            .unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut raw = String::new();
        archive
            .by_name(CACHED_FILES_ENTRY)
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();

        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw).unwrap();
        let keys: Vec<&String> = parsed.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    fn raw_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, file_options()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_parse_rejects_missing_metadata() {
        let bytes = raw_zip(&[("sources-root/a.h", b"a"), (FILE_PATH_ENTRY, b"/a.c")]);
        let err = Bundle::parse(&bytes, BundleLimits::default()).unwrap_err();
        assert!(err.to_string().contains("missing build_command"));
    }

    #[test]
    fn test_parse_rejects_entries_outside_root() {
        let bytes = raw_zip(&[
            ("elsewhere/a.h", b"a"),
            (BUILD_COMMAND_ENTRY, b"gcc"),
            (FILE_PATH_ENTRY, b"/a.c"),
        ]);
        assert!(matches!(
            Bundle::parse(&bytes, BundleLimits::default()),
            Err(OrchestratorError::InvalidBundle(_))
        ));
    }

    #[test]
    fn test_parse_rejects_traversal() {
        let bytes = raw_zip(&[
            ("sources-root/../../etc/passwd", b"x"),
            (BUILD_COMMAND_ENTRY, b"gcc"),
            (FILE_PATH_ENTRY, b"/a.c"),
        ]);
        assert!(Bundle::parse(&bytes, BundleLimits::default()).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Bundle::parse(b"not a zip", BundleLimits::default()),
            Err(OrchestratorError::InvalidBundle(_))
        ));
    }

    #[test]
    fn test_parse_enforces_entry_limit() {
        let bytes = raw_zip(&[
            ("sources-root/a.h", &[1u8; 64]),
            (BUILD_COMMAND_ENTRY, b"gcc"),
            (FILE_PATH_ENTRY, b"/a.c"),
        ]);
        let limits = BundleLimits {
            max_entry_uncompressed_bytes: 16,
            ..BundleLimits::default()
        };
        let err = Bundle::parse(&bytes, limits).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_write_sources_and_resolve() {
        let dir = TempDir::new().unwrap();
        let mut builder = BundleBuilder::new();
        builder.add_file(Path::new("/src/main.c"), b"int main;").unwrap();
        let bytes = builder.finish(&metadata(&[])).unwrap();

        let bundle = Bundle::parse(&bytes, BundleLimits::default()).unwrap();
        bundle.write_sources(dir.path()).unwrap();

        let resolved = Bundle::resolve(dir.path(), &bundle.metadata.file_path).unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"int main;");
    }
}
