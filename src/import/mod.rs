//! Importer/converter (spec §4.C): streams a source container's tensor-data
//! region into fixed-size content-addressed shards and derives the
//! manifest. Grounded on the teacher's `merge::output::write_gguf`/
//! `write_safetensors` for "write in fixed windows with explicit offset
//! bookkeeping", and on `commands::hf_download_file`'s chunk loop (read →
//! buffer → periodically report progress → check a cancel signal) for the
//! shape of the per-chunk loop, generalized from network bytes to any
//! [`ByteSource`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use memmap2::Mmap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{HashAlgorithm, SHARD_SIZE};
use crate::error::ImportError;
use crate::format::{self, ParsedContainer};
use crate::manifest::{sanitize_model_id, Manifest, Shard, Span, TensorLocation};
use crate::store::{self, ModelHandle};

/// An opaque byte source the importer reads from. `slice` must be cheap and
/// random-access; `supports_streaming` only affects the chunk size policy
/// the importer uses when walking the tensor-data region (spec §4.C's
/// "streaming" vs "fallback" variants collapse to that one policy knob).
pub trait ByteSource: Send {
    fn len(&self) -> u64;
    fn slice(&self, start: u64, end: u64) -> std::io::Result<Vec<u8>>;
    fn supports_streaming(&self) -> bool {
        true
    }
}

/// A single memory-mapped file, grounded on the teacher's `Mmap::map` use
/// in `model::gguf::parse`/`model::safetensors::parse`.
pub struct FileByteSource {
    mmap: Mmap,
}

impl FileByteSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }
}

impl ByteSource for FileByteSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn slice(&self, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        let (start, end) = (start as usize, end as usize);
        Ok(self.mmap.get(start..end).map(|s| s.to_vec()).unwrap_or_default())
    }
}

/// Concatenation of several file sources in a fixed order, used for
/// multi-file Format S sources referenced by a sibling index JSON (spec
/// §4.C "Multi-file S sources").
pub struct ConcatByteSource {
    parts: Vec<FileByteSource>,
    boundaries: Vec<u64>,
    total: u64,
}

impl ConcatByteSource {
    pub fn new(parts: Vec<FileByteSource>) -> Self {
        let mut boundaries = Vec::with_capacity(parts.len() + 1);
        let mut running = 0u64;
        boundaries.push(0);
        for p in &parts {
            running += p.len();
            boundaries.push(running);
        }
        Self {
            total: running,
            parts,
            boundaries,
        }
    }
}

impl ByteSource for ConcatByteSource {
    fn len(&self) -> u64 {
        self.total
    }

    fn slice(&self, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity((end - start) as usize);
        for (i, part) in self.parts.iter().enumerate() {
            let part_start = self.boundaries[i];
            let part_end = self.boundaries[i + 1];
            let lo = start.max(part_start);
            let hi = end.min(part_end);
            if lo < hi {
                out.extend(part.slice(lo - part_start, hi - part_start)?);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum ImportProgress {
    Parsing {
        model_id: String,
        model_type: String,
    },
    Sharding {
        current: u32,
        total: u32,
        percent: f64,
    },
    Complete {
        model_id: String,
        shard_count: u32,
        total_size: u64,
    },
}

fn derive_model_id(parsed: &ParsedContainer, fallback_name: &str) -> String {
    let raw = parsed
        .model_type
        .clone()
        .or_else(|| parsed.architecture.name.clone())
        .unwrap_or_else(|| fallback_name.to_string());
    sanitize_model_id(&raw)
}

/// Translate a tensor's absolute offset within the tensor-data region into
/// a single-shard or multi-shard location, per spec §4.C step 6.
fn locate_tensor(offset_from_origin: u64, byte_size: u64, shape: &[u64], dtype: crate::dtype::DType) -> TensorLocation {
    let start_shard = (offset_from_origin / SHARD_SIZE) as u32;
    let offset_in_shard = offset_from_origin % SHARD_SIZE;

    if offset_in_shard + byte_size <= SHARD_SIZE {
        return TensorLocation::Single {
            shard: start_shard,
            offset_in_shard,
            size: byte_size,
            shape: shape.to_vec(),
            dtype,
        };
    }

    let mut spans = Vec::new();
    let mut remaining = byte_size;
    let mut shard = start_shard;
    let mut offset = offset_in_shard;
    while remaining > 0 {
        let chunk = (SHARD_SIZE - offset).min(remaining);
        spans.push(Span {
            shard,
            offset_in_shard: offset,
            size: chunk,
        });
        remaining -= chunk;
        shard += 1;
        offset = 0;
    }

    TensorLocation::Multi {
        spans,
        size: byte_size,
        shape: shape.to_vec(),
        dtype,
    }
}

pub struct ImportOptions {
    pub root: std::path::PathBuf,
    pub hash_algorithm: HashAlgorithm,
    pub quantize_override: Option<crate::dtype::DType>,
    pub fallback_name: String,
}

/// Run the import algorithm end to end (spec §4.C steps 1-7), reporting
/// progress on `progress_tx` and checking `cancel` at every suspension
/// point. On cancellation the partially populated model directory is
/// deleted and [`ImportError::Cancelled`] is returned.
pub async fn import(
    source: &dyn ByteSource,
    header_prefix_len: usize,
    options: ImportOptions,
    progress_tx: Option<mpsc::Sender<ImportProgress>>,
    cancel: CancellationToken,
) -> Result<Manifest, ImportError> {
    let prefix_len = (header_prefix_len as u64).min(source.len());
    let prefix = source.slice(0, prefix_len)?;

    let parsed = parse_prefix(&prefix)?;
    let model_id = derive_model_id(&parsed, &options.fallback_name);

    let root_handle = store::open_model(&options.root, &model_id).map_err(ImportError::Store)?;

    if let Some(tx) = &progress_tx {
        let _ = tx
            .send(ImportProgress::Parsing {
                model_id: model_id.clone(),
                model_type: parsed.model_type.clone().unwrap_or_default(),
            })
            .await;
    }

    if cancel.is_cancelled() {
        cleanup(&options.root, &model_id);
        return Err(ImportError::Cancelled);
    }

    let data_len = source.len() - parsed.tensor_data_origin;
    let total_shards = data_len.div_ceil(SHARD_SIZE).max(1) as u32;
    let chunk_size: u64 = if source.supports_streaming() {
        1024 * 1024
    } else {
        SHARD_SIZE
    };

    let mut shards = Vec::new();
    let mut buffer: Vec<u8> = Vec::with_capacity(SHARD_SIZE as usize);
    let mut shard_index = 0u32;
    let mut cursor = parsed.tensor_data_origin;
    let end = source.len();
    let mut running_offset = 0u64;

    while cursor < end {
        if cancel.is_cancelled() {
            cleanup(&options.root, &model_id);
            return Err(ImportError::Cancelled);
        }

        let take = chunk_size.min(end - cursor);
        let chunk = source.slice(cursor, cursor + take)?;
        cursor += take;

        let mut remaining = chunk.as_slice();
        while !remaining.is_empty() {
            let space = SHARD_SIZE as usize - buffer.len();
            let n = space.min(remaining.len());
            buffer.extend_from_slice(&remaining[..n]);
            remaining = &remaining[n..];

            if buffer.len() == SHARD_SIZE as usize {
                shards.push(finalize_shard(
                    &root_handle,
                    shard_index,
                    &buffer,
                    options.hash_algorithm,
                    running_offset,
                )?);
                running_offset += buffer.len() as u64;
                shard_index += 1;
                buffer.clear();

                if let Some(tx) = &progress_tx {
                    let _ = tx
                        .send(ImportProgress::Sharding {
                            current: shard_index,
                            total: total_shards,
                            percent: (shard_index as f64 / total_shards as f64) * 100.0,
                        })
                        .await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        shards.push(finalize_shard(
            &root_handle,
            shard_index,
            &buffer,
            options.hash_algorithm,
            running_offset,
        )?);
        shard_index += 1;
    }

    let tensors = build_tensor_map(&parsed, running_offset, &buffer);
    let quantization = options
        .quantize_override
        .unwrap_or(parsed.quantization)
        .as_str()
        .to_string();

    let total_size: u64 = shards.iter().map(|s| s.size).sum();
    let full_hash = compute_full_hash(options.hash_algorithm, &shards);

    let manifest = Manifest {
        version: 1,
        model_id: model_id.clone(),
        model_type: parsed.model_type.clone().unwrap_or_else(|| "unknown".into()),
        quantization,
        hash_algorithm: options.hash_algorithm,
        architecture: parsed.architecture.clone(),
        moe_config: parsed.moe_config.clone(),
        shards,
        tensors,
        total_size,
        full_hash: Some(full_hash),
        metadata: parsed.metadata.clone(),
        tokenizer: None,
    };

    let json = manifest
        .to_pretty_json()
        .map_err(|e| ImportError::Store(crate::error::StoreError::Json(e)))?;
    store::save_manifest(&root_handle, &json).map_err(ImportError::Store)?;

    if let Some(tx) = &progress_tx {
        let _ = tx
            .send(ImportProgress::Complete {
                model_id,
                shard_count: shard_index,
                total_size,
            })
            .await;
    }

    Ok(manifest)
}

fn parse_prefix(prefix: &[u8]) -> Result<ParsedContainer, ImportError> {
    if prefix.len() >= 4 && &prefix[0..4] == b"GGUF" {
        Ok(format::gguf::parse(prefix)?)
    } else {
        Ok(format::safetensors::parse(prefix)?)
    }
}

fn finalize_shard(
    handle: &ModelHandle,
    index: u32,
    bytes: &[u8],
    algorithm: HashAlgorithm,
    offset: u64,
) -> Result<Shard, ImportError> {
    let hash_hex = crate::store::hash::digest(algorithm, bytes);
    store::write_shard(handle, index, bytes, algorithm, None).map_err(ImportError::Store)?;
    Ok(Shard {
        index,
        filename: Shard::filename_for_index(index),
        size: bytes.len() as u64,
        hash_hex,
        offset,
    })
}

fn build_tensor_map(
    parsed: &ParsedContainer,
    _last_shard_offset: u64,
    _last_shard_buf: &[u8],
) -> HashMap<String, TensorLocation> {
    let mut map = HashMap::new();
    for descriptor in &parsed.descriptors {
        let offset_from_origin = descriptor.byte_offset - parsed.tensor_data_origin;
        let loc = locate_tensor(offset_from_origin, descriptor.byte_size, &descriptor.shape, descriptor.dtype);
        map.insert(descriptor.name.clone(), loc);
    }
    map
}

/// I3 (resolved open question): the full-model hash is the hash of the
/// concatenation of every shard's own hash, in shard order.
fn compute_full_hash(algorithm: HashAlgorithm, shards: &[Shard]) -> String {
    let mut hasher = crate::store::hash::streaming(algorithm);
    for shard in shards {
        hasher.update(shard.hash_hex.as_bytes());
    }
    hasher.finalize_hex()
}

fn cleanup(root: &Path, model_id: &str) {
    let _ = store::delete_model(root, model_id);
}
