//! Format S: an 8-byte length-prefixed JSON header followed by raw tensor
//! bytes (spec §4.A). Grounded on the teacher's `model::safetensors::
//! parse_header` (header-length read, `__metadata__` key convention,
//! `data_offsets` pair) generalized to operate on a bounded prefix slice
//! instead of a memory-mapped whole file.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::config::HEADER_READ;
use crate::dtype::DType;
use crate::error::FormatError;
use crate::manifest::{Architecture, TensorDescriptor};

use super::ParsedContainer;

#[derive(Debug, Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

/// Read just the 8-byte little-endian header length. Exposed separately so
/// the multi-file importer can compute per-part data-region sizes without
/// re-parsing the whole header.
pub fn header_len(prefix: &[u8]) -> Result<u64, FormatError> {
    if prefix.len() < 8 {
        return Err(FormatError::Truncated {
            offset: 0,
            need: 8,
            have: prefix.len(),
        });
    }
    let len = u64::from_le_bytes(prefix[0..8].try_into().unwrap());
    if len == 0 || len as usize > HEADER_READ {
        return Err(FormatError::HeaderTooLarge(len));
    }
    Ok(len)
}

fn parse_header_json(prefix: &[u8]) -> Result<(u64, serde_json::Map<String, Json>), FormatError> {
    let len = header_len(prefix)?;
    let end = 8 + len as usize;
    if end > prefix.len() {
        return Err(FormatError::Truncated {
            offset: 8,
            need: len as usize,
            have: prefix.len().saturating_sub(8),
        });
    }

    let value: Json = serde_json::from_slice(&prefix[8..end])
        .map_err(|e| FormatError::InvalidJson(e.to_string()))?;
    let map = value
        .as_object()
        .cloned()
        .ok_or_else(|| FormatError::InvalidJson("header is not a JSON object".into()))?;
    Ok((len, map))
}

/// Parse a single Format S file header. `prefix` must contain at least the
/// 8-byte length field plus the full JSON header.
pub fn parse(prefix: &[u8]) -> Result<ParsedContainer, FormatError> {
    let (len, map) = parse_header_json(prefix)?;
    let data_origin = 8 + len;

    let mut metadata = HashMap::new();
    let mut descriptors = Vec::with_capacity(map.len());

    for (name, entry) in &map {
        if name == "__metadata__" {
            if let Some(obj) = entry.as_object() {
                for (k, v) in obj {
                    if let Some(s) = v.as_str() {
                        metadata.insert(k.clone(), s.to_string());
                    }
                }
            }
            continue;
        }

        let raw: RawEntry = serde_json::from_value(entry.clone())
            .map_err(|e| FormatError::InvalidJson(format!("tensor {name}: {e}")))?;
        let dtype = DType::from_str_tag(&raw.dtype)
            .ok_or_else(|| FormatError::UnknownDtype(raw.dtype.clone()))?;

        let [start, stop] = raw.data_offsets;
        if stop < start {
            return Err(FormatError::InvalidJson(format!(
                "tensor {name} has inverted data_offsets"
            )));
        }

        descriptors.push(TensorDescriptor {
            name: name.clone(),
            shape: raw.shape,
            dtype,
            byte_size: stop - start,
            byte_offset: data_origin + start,
        });
    }

    descriptors.sort_by_key(|d| d.byte_offset);

    let architecture = Architecture {
        name: metadata.get("model_type").cloned(),
        hidden_size: None,
        num_layers: None,
        num_attention_heads: None,
        num_kv_heads: None,
        vocab_size: None,
        context_length: None,
    };

    let quantization = super::pick_quantization(&descriptors);

    Ok(ParsedContainer {
        descriptors,
        architecture,
        quantization,
        tensor_data_origin: data_origin,
        moe_config: None,
        model_type: metadata.get("model_type").cloned(),
        metadata,
    })
}

/// Consume a `model.safetensors.index.json`-style sibling index, returning
/// the ordered, de-duplicated list of part filenames referenced by its
/// `weight_map`, in first-appearance order (spec §4.A/§4.C).
pub fn parse_index(index_bytes: &[u8]) -> Result<Vec<String>, FormatError> {
    let value: Json =
        serde_json::from_slice(index_bytes).map_err(|e| FormatError::InvalidJson(e.to_string()))?;
    let weight_map = value
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| FormatError::InvalidJson("index missing weight_map object".into()))?;

    let mut seen = Vec::new();
    for (_, file) in weight_map {
        if let Some(name) = file.as_str() {
            if !seen.iter().any(|s: &String| s == name) {
                seen.push(name.to_string());
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(json: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(json.len() as u64).to_le_bytes());
        buf.extend_from_slice(json.as_bytes());
        buf
    }

    #[test]
    fn tiny_single_shard_round_trip() {
        let json = r#"{"w":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let prefix = header_bytes(json);
        let parsed = parse(&prefix).unwrap();
        assert_eq!(parsed.descriptors.len(), 1);
        let d = &parsed.descriptors[0];
        assert_eq!(d.name, "w");
        assert_eq!(d.byte_size, 16);
        assert_eq!(d.byte_offset, prefix.len() as u64);
    }

    #[test]
    fn tensors_are_sorted_by_ascending_offset() {
        let json = r#"{
            "second":{"dtype":"F32","shape":[1],"data_offsets":[4,8]},
            "first":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}
        }"#;
        let prefix = header_bytes(json);
        let parsed = parse(&prefix).unwrap();
        assert_eq!(parsed.descriptors[0].name, "first");
        assert_eq!(parsed.descriptors[1].name, "second");
    }

    #[test]
    fn metadata_key_is_excluded_from_tensors() {
        let json = r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#;
        let prefix = header_bytes(json);
        let parsed = parse(&prefix).unwrap();
        assert_eq!(parsed.descriptors.len(), 1);
        assert_eq!(parsed.metadata.get("format"), Some(&"pt".to_string()));
    }

    #[test]
    fn rejects_unknown_dtype() {
        let json = r#"{"w":{"dtype":"NOPE","shape":[1],"data_offsets":[0,4]}}"#;
        let prefix = header_bytes(json);
        assert!(matches!(parse(&prefix), Err(FormatError::UnknownDtype(_))));
    }

    #[test]
    fn parses_weight_map_index_in_first_seen_order() {
        let json = r#"{"metadata":{},"weight_map":{"a":"part-1.safetensors","b":"part-0.safetensors","c":"part-1.safetensors"}}"#;
        let files = parse_index(json.as_bytes()).unwrap();
        assert_eq!(files, vec!["part-1.safetensors".to_string(), "part-0.safetensors".to_string()]);
    }
}
