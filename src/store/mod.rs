//! Content-addressed shard store (spec §4.B). Grounded on the teacher's
//! app-data directory resolution (`commands::get_models_dir`) generalized
//! from a Tauri `AppHandle` to the `directories` crate, and on the
//! `other_examples` block-store's create/open-with-managed-cleanup shape —
//! reworked here around explicit `Result`s and an explicit open-model
//! handle rather than process-wide mutable state.

pub mod hash;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::config::{HashAlgorithm, ALIGNMENT};
use crate::error::StoreError;
use crate::manifest::sanitize_model_id;

/// A model directory this process currently has open. Returned by
/// [`open_model`]; all other operations take one by reference (design
/// note §9's explicit handle instead of ambient "currently open model"
/// global state).
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub model_id: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub exists: bool,
    pub shard_count: u32,
    pub total_size: u64,
    pub has_manifest: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IntegrityReport {
    pub missing: Vec<u32>,
    pub corrupt: Vec<u32>,
}

/// Resolve (and create if absent) the per-origin persistent root:
/// `<project data dir>/doppler-models`.
pub fn init_root(root_override: Option<PathBuf>) -> Result<PathBuf, StoreError> {
    let base = match root_override {
        Some(p) => p,
        None => ProjectDirs::from("", "", "doppler")
            .ok_or(StoreError::PlatformUnsupported)?
            .data_dir()
            .to_path_buf(),
    };
    let root = base.join("doppler-models");
    fs::create_dir_all(&root)?;
    Ok(root)
}

/// Sanitize `model_id` and create-or-open its directory under `root`.
pub fn open_model(root: &Path, model_id: &str) -> Result<ModelHandle, StoreError> {
    let sanitized = sanitize_model_id(model_id);
    let dir = root.join(&sanitized);
    fs::create_dir_all(&dir)?;
    Ok(ModelHandle {
        model_id: sanitized,
        dir,
    })
}

fn shard_path(handle: &ModelHandle, index: u32) -> PathBuf {
    handle
        .dir
        .join(crate::manifest::Shard::filename_for_index(index))
}

/// Write a shard, truncating any existing content. If `expected_hash` is
/// `Some`, verifies the buffer against it after writing and removes the
/// file on mismatch (spec §4.B `write_shard`).
pub fn write_shard(
    handle: &ModelHandle,
    index: u32,
    bytes: &[u8],
    algorithm: HashAlgorithm,
    expected_hash: Option<&str>,
) -> Result<Option<String>, StoreError> {
    let required = bytes.len() as u64;
    let available = crate::preflight::free_space_at(&handle.dir);
    if available < required {
        return Err(StoreError::QuotaExceeded {
            required,
            available,
        });
    }

    let path = shard_path(handle, index);
    let mut file = fs::File::create(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    match expected_hash {
        None => Ok(None),
        Some(expected) => {
            let actual = hash::digest(algorithm, bytes);
            if actual != expected {
                let _ = fs::remove_file(&path);
                return Err(StoreError::HashMismatch {
                    index,
                    expected: expected.to_string(),
                    actual,
                });
            }
            Ok(Some(actual))
        }
    }
}

/// Read the whole shard file, optionally verifying it against a known hash.
pub fn load_shard(
    handle: &ModelHandle,
    index: u32,
    algorithm: HashAlgorithm,
    expected_hash: Option<&str>,
) -> Result<Vec<u8>, StoreError> {
    let path = shard_path(handle, index);
    let bytes = fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::ShardNotFound { index },
        _ => StoreError::Io(e),
    })?;

    if let Some(expected) = expected_hash {
        let actual = hash::digest(algorithm, &bytes);
        if actual != expected {
            return Err(StoreError::HashMismatch {
                index,
                expected: expected.to_string(),
                actual,
            });
        }
    }

    Ok(bytes)
}

/// Read a bounded sub-range of a shard, aligning the underlying read to
/// 4096-byte boundaries and trimming back to the caller's window (spec
/// §4.B `load_shard_range`). Falls back to a whole-file read if positioned
/// reads are unavailable.
pub fn load_shard_range(
    handle: &ModelHandle,
    index: u32,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, StoreError> {
    let path = shard_path(handle, index);
    let mut file = fs::File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::ShardNotFound { index },
        _ => StoreError::Io(e),
    })?;

    let aligned_offset = (offset / ALIGNMENT) * ALIGNMENT;
    let end = offset + length;
    let aligned_end = end.div_ceil(ALIGNMENT) * ALIGNMENT;
    let aligned_len = aligned_end - aligned_offset;

    let mut buf = vec![0u8; aligned_len as usize];
    let read = read_at(&mut file, aligned_offset, &mut buf)?;
    buf.truncate(read);

    let start_in_buf = (offset - aligned_offset) as usize;
    let end_in_buf = (start_in_buf + length as usize).min(buf.len());
    Ok(buf.get(start_in_buf..end_in_buf).unwrap_or(&[]).to_vec())
}

#[cfg(unix)]
fn read_at(file: &mut fs::File, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
    use std::os::unix::fs::FileExt;
    let mut total = 0;
    loop {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::Io(e)),
        }
        if total == buf.len() {
            break;
        }
    }
    Ok(total)
}

#[cfg(not(unix))]
fn read_at(file: &mut fs::File, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::Io(e)),
        }
        if total == buf.len() {
            break;
        }
    }
    Ok(total)
}

pub fn shard_exists(handle: &ModelHandle, index: u32) -> bool {
    shard_path(handle, index).is_file()
}

pub fn delete_shard(handle: &ModelHandle, index: u32) -> Result<(), StoreError> {
    let path = shard_path(handle, index);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn delete_model(root: &Path, model_id: &str) -> Result<(), StoreError> {
    let sanitized = sanitize_model_id(model_id);
    let dir = root.join(&sanitized);
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

pub fn list_models(root: &Path) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    if !root.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn get_model_info(root: &Path, model_id: &str) -> Result<ModelInfo, StoreError> {
    let sanitized = sanitize_model_id(model_id);
    let dir = root.join(&sanitized);
    if !dir.is_dir() {
        return Ok(ModelInfo {
            exists: false,
            shard_count: 0,
            total_size: 0,
            has_manifest: false,
        });
    }

    let mut shard_count = 0u32;
    let mut total_size = 0u64;
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("shard_") && name.ends_with(".bin") {
            shard_count += 1;
            total_size += entry.metadata()?.len();
        }
    }

    Ok(ModelInfo {
        exists: true,
        shard_count,
        total_size,
        has_manifest: dir.join("manifest.json").is_file(),
    })
}

pub fn save_manifest(handle: &ModelHandle, text: &str) -> Result<(), StoreError> {
    fs::write(handle.dir.join("manifest.json"), text)?;
    Ok(())
}

pub fn load_manifest(handle: &ModelHandle) -> Result<String, StoreError> {
    fs::read_to_string(handle.dir.join("manifest.json")).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::ManifestNotFound,
        _ => StoreError::Io(e),
    })
}

pub fn save_tokenizer(handle: &ModelHandle, text: &str) -> Result<(), StoreError> {
    fs::write(handle.dir.join("tokenizer.json"), text)?;
    Ok(())
}

pub fn load_tokenizer(handle: &ModelHandle) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(handle.dir.join("tokenizer.json")) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Iterate every shard the manifest declares, categorizing by presence then
/// by hash match (spec §4.B `verify_integrity`).
pub fn verify_integrity(
    handle: &ModelHandle,
    manifest: &crate::manifest::Manifest,
) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();
    for shard in &manifest.shards {
        let path = shard_path(handle, shard.index);
        if !path.is_file() {
            report.missing.push(shard.index);
            continue;
        }
        let bytes = fs::read(&path)?;
        let actual = hash::digest(manifest.hash_algorithm, &bytes);
        if actual != shard.hash_hex {
            report.corrupt.push(shard.index);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashAlgorithm;

    fn temp_root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn write_then_load_shard_round_trips() {
        let root = temp_root();
        let handle = open_model(root.path(), "Some Model/v2").unwrap();
        assert_eq!(handle.model_id, "some-model-v2");

        let data = vec![7u8; 1024];
        let hash = hash::digest(HashAlgorithm::Blake3, &data);
        write_shard(&handle, 0, &data, HashAlgorithm::Blake3, Some(&hash)).unwrap();
        let loaded = load_shard(&handle, 0, HashAlgorithm::Blake3, Some(&hash)).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn write_shard_rejects_hash_mismatch_and_cleans_up() {
        let root = temp_root();
        let handle = open_model(root.path(), "m").unwrap();
        let data = vec![1u8; 16];
        let err = write_shard(&handle, 0, &data, HashAlgorithm::Sha256, Some("deadbeef"));
        assert!(matches!(err, Err(StoreError::HashMismatch { .. })));
        assert!(!shard_exists(&handle, 0));
    }

    #[test]
    fn load_missing_shard_reports_not_found() {
        let root = temp_root();
        let handle = open_model(root.path(), "m").unwrap();
        let err = load_shard(&handle, 3, HashAlgorithm::Blake3, None);
        assert!(matches!(err, Err(StoreError::ShardNotFound { index: 3 })));
    }

    #[test]
    fn load_shard_range_restores_exact_window() {
        let root = temp_root();
        let handle = open_model(root.path(), "m").unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        write_shard(&handle, 0, &data, HashAlgorithm::Blake3, None).unwrap();

        let window = load_shard_range(&handle, 0, 5000, 100).unwrap();
        assert_eq!(window, data[5000..5100]);
    }

    #[test]
    fn verify_integrity_reports_missing_and_corrupt() {
        let root = temp_root();
        let handle = open_model(root.path(), "m").unwrap();
        let good = vec![2u8; 8];
        let good_hash = hash::digest(HashAlgorithm::Blake3, &good);
        write_shard(&handle, 0, &good, HashAlgorithm::Blake3, None).unwrap();
        write_shard(&handle, 1, &[9u8; 8], HashAlgorithm::Blake3, None).unwrap();

        let manifest = crate::manifest::Manifest {
            version: 1,
            model_id: "m".into(),
            model_type: "llama".into(),
            quantization: "F32".into(),
            hash_algorithm: HashAlgorithm::Blake3,
            architecture: Default::default(),
            moe_config: None,
            shards: vec![
                crate::manifest::Shard {
                    index: 0,
                    filename: "shard_00000.bin".into(),
                    size: 8,
                    hash_hex: good_hash,
                    offset: 0,
                },
                crate::manifest::Shard {
                    index: 1,
                    filename: "shard_00001.bin".into(),
                    size: 8,
                    hash_hex: "f".repeat(64),
                    offset: 8,
                },
                crate::manifest::Shard {
                    index: 2,
                    filename: "shard_00002.bin".into(),
                    size: 8,
                    hash_hex: "a".repeat(64),
                    offset: 16,
                },
            ],
            tensors: HashMap::new(),
            total_size: 24,
            full_hash: None,
            metadata: HashMap::new(),
            tokenizer: None,
        };

        let report = verify_integrity(&handle, &manifest).unwrap();
        assert_eq!(report.missing, vec![2]);
        assert_eq!(report.corrupt, vec![1]);
    }
}
