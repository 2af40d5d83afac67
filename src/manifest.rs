//! The data model (spec §3): tensor descriptors, shards, tensor locations,
//! and the manifest that ties them together. `TensorLocation` is modeled as
//! an explicit tagged sum (design note §9) that still serializes to the
//! duck-typed on-disk shape spec §6 describes, via `#[serde(untagged)]`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::HashAlgorithm;
use crate::dtype::DType;

/// `{name, shape[], dtype, byte_size, byte_offset}` — `byte_offset` is
/// absolute within the source container's tensor-data region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub shape: Vec<u64>,
    pub dtype: DType,
    pub byte_size: u64,
    pub byte_offset: u64,
}

impl TensorDescriptor {
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// One fixed-size (except possibly the last) content-addressed slice of the
/// tensor-data region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub index: u32,
    #[serde(alias = "fileName")]
    pub filename: String,
    pub size: u64,
    #[serde(rename = "hash", alias = "blake3")]
    pub hash_hex: String,
    /// Absolute offset of this shard within the concatenated tensor-data
    /// stream; equal to the prefix sum of preceding shard sizes (I1).
    pub offset: u64,
}

impl Shard {
    pub fn filename_for_index(index: u32) -> String {
        format!("shard_{:05}.bin", index)
    }
}

/// A contiguous byte range inside one shard belonging to one tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub shard: u32,
    pub offset_in_shard: u64,
    pub size: u64,
}

/// Either a single-shard or multi-shard tensor location, discriminated by
/// which keys are present on the wire (spec §3/§6, design note §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorLocation {
    Single {
        shard: u32,
        offset_in_shard: u64,
        size: u64,
        shape: Vec<u64>,
        dtype: DType,
    },
    Multi {
        spans: Vec<Span>,
        size: u64,
        shape: Vec<u64>,
        dtype: DType,
    },
}

impl TensorLocation {
    pub fn size(&self) -> u64 {
        match self {
            TensorLocation::Single { size, .. } => *size,
            TensorLocation::Multi { size, .. } => *size,
        }
    }

    pub fn shape(&self) -> &[u64] {
        match self {
            TensorLocation::Single { shape, .. } => shape,
            TensorLocation::Multi { shape, .. } => shape,
        }
    }

    /// Every shard index this location touches, in order.
    pub fn shard_indices(&self) -> Vec<u32> {
        match self {
            TensorLocation::Single { shard, .. } => vec![*shard],
            TensorLocation::Multi { spans, .. } => spans.iter().map(|s| s.shard).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoeConfig {
    pub expert_count: u64,
    pub experts_per_token: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Architecture {
    pub name: Option<String>,
    pub hidden_size: Option<u64>,
    pub num_layers: Option<u64>,
    pub num_attention_heads: Option<u64>,
    pub num_kv_heads: Option<u64>,
    pub vocab_size: Option<u64>,
    pub context_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: Option<String>,
}

/// Root manifest record (spec §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(rename = "modelId", alias = "model_id")]
    pub model_id: String,
    #[serde(rename = "modelType", alias = "model_type")]
    pub model_type: String,
    pub quantization: String,
    #[serde(rename = "hashAlgorithm", alias = "hash_algorithm")]
    pub hash_algorithm: HashAlgorithm,
    pub architecture: Architecture,
    #[serde(rename = "moeConfig", alias = "moe_config", default)]
    pub moe_config: Option<MoeConfig>,
    pub shards: Vec<Shard>,
    pub tensors: HashMap<String, TensorLocation>,
    #[serde(rename = "totalSize", alias = "total_size")]
    pub total_size: u64,
    #[serde(rename = "fullHash", alias = "full_hash", default)]
    pub full_hash: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tokenizer: Option<TokenizerRef>,
}

impl Manifest {
    /// I1: sizes sum to total_size, offsets are prefix sums, indices match
    /// position.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();

        let sum: u64 = self.shards.iter().map(|s| s.size).sum();
        if sum != self.total_size {
            reasons.push(format!(
                "sum of shard sizes {sum} does not equal total_size {}",
                self.total_size
            ));
        }

        let mut running = 0u64;
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.index as usize != i {
                reasons.push(format!(
                    "shard at position {i} has index {} (expected {i})",
                    shard.index
                ));
            }
            if shard.offset != running {
                reasons.push(format!(
                    "shard {i} offset {} does not match prefix sum {running}",
                    shard.offset
                ));
            }
            if shard.hash_hex.len() != 64 || !shard.hash_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                reasons.push(format!("shard {i} hash is not 64 lowercase hex chars"));
            }
            running += shard.size;
        }

        let max_index = self.shards.len() as u32;
        for (name, loc) in &self.tensors {
            // I2: span sizes sum to the tensor's declared size.
            let declared = loc.size();
            match loc {
                TensorLocation::Single { shard, .. } => {
                    if *shard >= max_index {
                        reasons.push(format!("tensor {name} references unknown shard {shard}"));
                    }
                }
                TensorLocation::Multi { spans, .. } => {
                    let span_sum: u64 = spans.iter().map(|s| s.size).sum();
                    if span_sum != declared {
                        reasons.push(format!(
                            "tensor {name} span sizes sum to {span_sum}, expected {declared}"
                        ));
                    }
                    for w in spans.windows(2) {
                        if w[1].shard != w[0].shard + 1 {
                            reasons.push(format!(
                                "tensor {name} spans non-consecutive shards {} -> {}",
                                w[0].shard, w[1].shard
                            ));
                        }
                    }
                    for span in spans {
                        if span.shard >= max_index {
                            reasons
                                .push(format!("tensor {name} references unknown shard {}", span.shard));
                        }
                    }
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// I6: filesystem-name sanitization for `model_id`.
pub fn sanitize_model_id(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;

    for ch in lower.chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('-');
    let clamped: String = trimmed.chars().take(64).collect();
    let clamped = clamped.trim_end_matches('-');

    if clamped.is_empty() {
        "imported-model".to_string()
    } else {
        clamped.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Completed,
    Error,
}

/// Download state sidecar (spec §3/§6), keyed externally by `model_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    pub base_url: String,
    pub manifest: Manifest,
    #[serde(rename = "completedShards", alias = "completed_shards")]
    pub completed_shards: Vec<u32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub error: Option<String>,
}
