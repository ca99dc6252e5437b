//! Package persistence.
//!
//! Packages are staged into a hidden sibling directory, every file is
//! fsynced, and the directory is renamed onto its final path. A crash at any
//! point leaves either the previous package or the new one, never a mix.

pub mod weights;

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PathsConfig;
use crate::error::{ConvertError, Result};
use crate::lower::{FileEntry, LoweredArtifact};

const HASH_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Root directory receiving one package per converted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRoot {
    path: PathBuf,
}

impl OutputRoot {
    /// Create the root if needed. Calling this twice on the same path is fine.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)
            .map_err(|e| ConvertError::persistence("creating output root", &path, e))?;
        debug!("Output root ready at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final location of the package called `name`.
    pub fn package_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.path.join(format!(
            "{}{}{}-{}",
            PathsConfig::STAGING_PREFIX,
            name,
            PathsConfig::STAGING_SUFFIX,
            std::process::id()
        ))
    }

    fn aside_path(&self, name: &str) -> PathBuf {
        self.path.join(format!(
            "{}{}{}",
            PathsConfig::STAGING_PREFIX,
            name,
            PathsConfig::ASIDE_SUFFIX
        ))
    }

    /// Staging and set-aside directories for `name` left by interrupted runs,
    /// whatever process created them.
    fn leftovers(&self, name: &str) -> Result<Vec<PathBuf>> {
        let staging_prefix = format!(
            "{}{}{}-",
            PathsConfig::STAGING_PREFIX,
            name,
            PathsConfig::STAGING_SUFFIX
        );
        let aside = self.aside_path(name);

        let listing_err = |e| ConvertError::persistence("listing output root", &self.path, e);
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(listing_err)? {
            let entry = entry.map_err(listing_err)?;
            let path = entry.path();
            let is_staging = entry.file_name().to_str().is_some_and(|file_name| {
                file_name
                    .strip_prefix(&staging_prefix)
                    .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
            });
            if is_staging || path == aside {
                found.push(path);
            }
        }
        Ok(found)
    }
}

/// A package that reached its final path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenPackage {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Writes lowered artifacts into an [`OutputRoot`].
pub struct ArtifactWriter {
    root: OutputRoot,
}

impl ArtifactWriter {
    pub fn new(root: OutputRoot) -> Self {
        Self { root }
    }

    /// Persist `artifact` as `<root>/<name>`, replacing any previous package.
    pub fn write(&self, artifact: &LoweredArtifact, name: &str) -> Result<WrittenPackage> {
        validate_name(name)?;
        let staging = self.root.staging_path(name);
        let aside = self.root.aside_path(name);
        let target = self.root.package_path(name);

        for stale in self.root.leftovers(name)? {
            warn!("Removing leftover directory {}", stale.display());
            remove_dir(&stale)?;
        }

        let staged = stage(artifact, &staging);
        if let Err(e) = staged {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Failed to clean up {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        publish(&staging, &aside, &target)?;
        let size_bytes = dir_size(&target)?;
        info!("Wrote {} ({} bytes)", target.display(), size_bytes);
        Ok(WrittenPackage {
            path: target,
            size_bytes,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\');
    if bad {
        return Err(ConvertError::Persistence {
            path: PathBuf::from(name),
            message: "package name must be a plain, non-hidden directory name".to_string(),
            source: None,
        });
    }
    Ok(())
}

/// Write every package file under `dir`, manifest last.
fn stage(artifact: &LoweredArtifact, dir: &Path) -> Result<()> {
    let program = serde_json::to_vec_pretty(&artifact.program)?;
    let weight_bytes = weights::encode(&artifact.weights)?;

    let mut files = Vec::new();
    for (relative, bytes) in [
        (PathsConfig::PROGRAM_FILE, program.as_slice()),
        (PathsConfig::WEIGHTS_FILE, weight_bytes.as_slice()),
        (PathsConfig::TOKENIZER_FILE, artifact.tokenizer_json.as_bytes()),
    ] {
        let path = dir.join(relative);
        write_synced(&path, bytes)?;
        files.push(FileEntry {
            path: relative.to_string(),
            sha256: sha256_file(&path)?,
            size_bytes: bytes.len() as u64,
        });
    }

    let mut manifest = artifact.manifest.clone();
    manifest.files = files;
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    write_synced(&dir.join(PathsConfig::MANIFEST_FILE), &manifest_bytes)?;
    sync_dir(dir);
    debug!("Staged package in {}", dir.display());
    Ok(())
}

/// Rename the staged directory onto `target`, moving an existing package
/// aside first and removing it once the new one is in place.
fn publish(staging: &Path, aside: &Path, target: &Path) -> Result<()> {
    let previous = if target.exists() {
        fs::rename(target, aside)
            .map_err(|e| ConvertError::persistence("moving previous package aside", target, e))?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(staging, target) {
        if let Some(aside) = previous {
            if let Err(restore) = fs::rename(aside, target) {
                warn!("Failed to restore {}: {}", target.display(), restore);
            }
        }
        if let Err(cleanup) = fs::remove_dir_all(staging) {
            warn!("Failed to clean up {}: {}", staging.display(), cleanup);
        }
        return Err(ConvertError::persistence("renaming staged package", staging, e));
    }

    if let Some(aside) = previous {
        if let Err(e) = fs::remove_dir_all(aside) {
            warn!("Failed to remove previous package {}: {}", aside.display(), e);
        }
    }
    if let Some(parent) = target.parent() {
        sync_dir(parent);
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ConvertError::persistence("creating directory", parent, e))?;
    }
    let mut file =
        File::create(path).map_err(|e| ConvertError::persistence("creating file", path, e))?;
    file.write_all(bytes)
        .map_err(|e| ConvertError::persistence("writing file", path, e))?;
    file.flush()
        .map_err(|e| ConvertError::persistence("flushing file", path, e))?;
    file.sync_all()
        .map_err(|e| ConvertError::persistence("syncing file", path, e))?;
    Ok(())
}

/// Best-effort directory fsync so the rename itself is durable.
fn sync_dir(dir: &Path) {
    match File::open(dir) {
        Ok(handle) => {
            if let Err(e) = handle.sync_all() {
                debug!("Directory sync skipped for {}: {}", dir.display(), e);
            }
        }
        Err(e) => debug!("Directory sync skipped for {}: {}", dir.display(), e),
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir).map_err(|e| ConvertError::persistence("removing directory", dir, e))
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| ConvertError::io("opening file for hashing", path, e))?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| ConvertError::io("reading file for hashing", path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursive sum of regular file sizes under `dir`.
pub fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| ConvertError::Persistence {
            path: dir.to_path_buf(),
            message: format!("walking package: {e}"),
            source: None,
        })?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| ConvertError::Persistence {
                    path: entry.path().to_path_buf(),
                    message: format!("reading file size: {e}"),
                    source: None,
                })?;
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DType, TensorSpec};
    use crate::lower::{
        ComputeUnits, Manifest, Preprocessing, Program, Provenance, StoredTensor, FORMAT_VERSION,
    };
    use crate::registry::ModelKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn artifact() -> LoweredArtifact {
        let input = TensorSpec {
            name: "input_ids".into(),
            dtype: DType::Int32,
            shape: vec![1, 4],
        };
        let mut weights = BTreeMap::new();
        weights.insert(
            "w".to_string(),
            StoredTensor::Float32 {
                shape: vec![2, 2],
                data: vec![1.0, 2.0, 3.0, 4.0],
            },
        );
        LoweredArtifact {
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                name: "pkg".into(),
                deployment_target: 3,
                compute_units: ComputeUnits::All,
                inputs: vec![input.clone()],
                outputs: vec![],
                classifier: None,
                quantization: None,
                preprocessing: Preprocessing {
                    max_length: 4,
                    pad_token_id: 0,
                },
                provenance: Provenance {
                    source: "local".into(),
                    model_type: "bert".into(),
                    kind: ModelKind::Embedding,
                    converter: "test".into(),
                    created_at: chrono::Utc::now(),
                },
                files: vec![],
            },
            program: Program {
                spec_version: 3,
                inputs: vec![input],
                weights: vec![],
                nodes: vec![],
                outputs: vec![],
            },
            weights,
            tokenizer_json: "{}".into(),
        }
    }

    #[test]
    fn test_output_root_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/nested");
        let first = OutputRoot::init(&path).unwrap();
        let second = OutputRoot::init(&path).unwrap();
        assert_eq!(first, second);
        assert!(path.is_dir());
    }

    #[test]
    fn test_write_layout_and_digests() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(OutputRoot::init(temp.path()).unwrap());
        let written = writer.write(&artifact(), "pkg").unwrap();

        assert_eq!(written.path, temp.path().join("pkg"));
        for file in [
            PathsConfig::MANIFEST_FILE,
            PathsConfig::PROGRAM_FILE,
            PathsConfig::WEIGHTS_FILE,
            PathsConfig::TOKENIZER_FILE,
        ] {
            assert!(written.path.join(file).is_file(), "{file} missing");
        }

        let manifest: Manifest = serde_json::from_slice(
            &fs::read(written.path.join(PathsConfig::MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 3);
        for entry in &manifest.files {
            let path = written.path.join(&entry.path);
            assert_eq!(sha256_file(&path).unwrap(), entry.sha256);
            assert_eq!(fs::metadata(&path).unwrap().len(), entry.size_bytes);
        }
        assert_eq!(written.size_bytes, dir_size(&written.path).unwrap());
    }

    #[test]
    fn test_no_staging_left_and_overwrite_replaces() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(OutputRoot::init(temp.path()).unwrap());
        writer.write(&artifact(), "pkg").unwrap();
        fs::write(temp.path().join("pkg/stray.txt"), b"old").unwrap();
        writer.write(&artifact(), "pkg").unwrap();

        let entries: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["pkg".to_string()]);
        assert!(!temp.path().join("pkg/stray.txt").exists());
    }

    #[test]
    fn test_leftovers_from_interrupted_runs_are_swept() {
        let temp = TempDir::new().unwrap();
        let root = OutputRoot::init(temp.path()).unwrap();
        for leftover in [".pkg.partial-4242", ".pkg.partial-1", ".pkg.old"] {
            fs::create_dir_all(temp.path().join(leftover).join("Data")).unwrap();
            fs::write(temp.path().join(leftover).join("Manifest.json"), b"{}").unwrap();
        }
        // Another package's staging directory is left alone.
        fs::create_dir_all(temp.path().join(".pkg.partial-x.partial-7")).unwrap();

        let writer = ArtifactWriter::new(root);
        writer.write(&artifact(), "pkg").unwrap();

        let mut entries: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![".pkg.partial-x.partial-7".to_string(), "pkg".to_string()]
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(OutputRoot::init(temp.path()).unwrap());
        for name in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                writer.write(&artifact(), name),
                Err(ConvertError::Persistence { .. })
            ));
        }
    }

    #[test]
    fn test_dir_size_sums_nested_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("a/one"), [0u8; 10]).unwrap();
        fs::write(temp.path().join("a/b/two"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(temp.path()).unwrap(), 15);
    }
}
