//! Format G: a tagged little-endian binary container (spec §4.A). Magic
//! `GGUF`, versions 2 and 3, a metadata key/value section, then tensor
//! records, then 32-byte alignment padding to the tensor-data origin.
//!
//! Grounded on the teacher's `model::gguf::parse` (the `Reader` cursor, the
//! metadata value-tag switch, the ggml type name table) generalized from a
//! whole-file `Mmap` to an arbitrary bounded byte slice, since this parser
//! must stay pure and never see tensor bulk data.

use std::collections::HashMap;

use crate::config::HEADER_READ;
use crate::dtype::DType;
use crate::error::FormatError;
use crate::manifest::{Architecture, MoeConfig, TensorDescriptor};

use super::ParsedContainer;

const MAGIC: &[u8; 4] = b"GGUF";
const ALIGNMENT: usize = 32;
const MAX_STRING_LEN: u64 = 1_000_000;
const MAX_ARRAY_LEN: u64 = 10_000_000;

const TYPE_UINT8: u32 = 0;
const TYPE_INT8: u32 = 1;
const TYPE_UINT16: u32 = 2;
const TYPE_INT16: u32 = 3;
const TYPE_UINT32: u32 = 4;
const TYPE_INT32: u32 = 5;
const TYPE_FLOAT32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_UINT64: u32 = 10;
const TYPE_INT64: u32 = 11;
const TYPE_FLOAT64: u32 = 12;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.pos + n > self.data.len() {
            return Err(FormatError::Truncated {
                offset: self.pos,
                need: n,
                have: self.data.len().saturating_sub(self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.read_bytes(1)?[0])
    }
    fn read_i8(&mut self) -> Result<i8, FormatError> {
        Ok(self.read_u8()? as i8)
    }
    fn read_u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }
    fn read_i16(&mut self) -> Result<i16, FormatError> {
        Ok(i16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }
    fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }
    fn read_f32(&mut self) -> Result<f32, FormatError> {
        Ok(f32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }
    fn read_u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
    fn read_f64(&mut self) -> Result<f64, FormatError> {
        Ok(f64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
    fn read_bool(&mut self) -> Result<bool, FormatError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_string(&mut self) -> Result<String, FormatError> {
        let len = self.read_u64()?;
        if len > MAX_STRING_LEN {
            return Err(FormatError::OversizedString(len));
        }
        let bytes = self.read_bytes(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| FormatError::InvalidJson(format!("invalid UTF-8 string: {e}")))
    }
}

#[derive(Debug, Clone)]
enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl Value {
    fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::U8(v) => Some(v.to_string()),
            Value::I8(v) => Some(v.to_string()),
            Value::U16(v) => Some(v.to_string()),
            Value::I16(v) => Some(v.to_string()),
            Value::U32(v) => Some(v.to_string()),
            Value::I32(v) => Some(v.to_string()),
            Value::F32(v) => Some(v.to_string()),
            Value::Bool(v) => Some(v.to_string()),
            Value::U64(v) => Some(v.to_string()),
            Value::I64(v) => Some(v.to_string()),
            Value::F64(v) => Some(v.to_string()),
            Value::Array(_) => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(*v as u64),
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            Value::I8(v) if *v >= 0 => Some(*v as u64),
            Value::I16(v) if *v >= 0 => Some(*v as u64),
            Value::I32(v) if *v >= 0 => Some(*v as u64),
            Value::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

fn read_value(reader: &mut Reader, value_type: u32) -> Result<Value, FormatError> {
    match value_type {
        TYPE_UINT8 => Ok(Value::U8(reader.read_u8()?)),
        TYPE_INT8 => Ok(Value::I8(reader.read_i8()?)),
        TYPE_UINT16 => Ok(Value::U16(reader.read_u16()?)),
        TYPE_INT16 => Ok(Value::I16(reader.read_i16()?)),
        TYPE_UINT32 => Ok(Value::U32(reader.read_u32()?)),
        TYPE_INT32 => Ok(Value::I32(reader.read_u32()? as i32)),
        TYPE_FLOAT32 => Ok(Value::F32(reader.read_f32()?)),
        TYPE_BOOL => Ok(Value::Bool(reader.read_bool()?)),
        TYPE_STRING => Ok(Value::String(reader.read_string()?)),
        TYPE_ARRAY => {
            let elem_type = reader.read_u32()?;
            let count = reader.read_u64()?;
            if count > MAX_ARRAY_LEN {
                return Err(FormatError::OversizedArray(count));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            for _ in 0..count {
                items.push(read_value(reader, elem_type)?);
            }
            Ok(Value::Array(items))
        }
        TYPE_UINT64 => Ok(Value::U64(reader.read_u64()?)),
        TYPE_INT64 => Ok(Value::I64(reader.read_u64()? as i64)),
        TYPE_FLOAT64 => Ok(Value::F64(reader.read_f64()?)),
        other => Err(FormatError::UnknownDtype(format!("metadata tag {other}"))),
    }
}

/// Parse a Format G header. `prefix` must be the leading bytes of the
/// source (at most [`HEADER_READ`] bytes, per spec §4.A).
pub fn parse(prefix: &[u8]) -> Result<ParsedContainer, FormatError> {
    debug_assert!(prefix.len() <= HEADER_READ);

    let mut reader = Reader::new(prefix);

    let magic = reader.read_bytes(4)?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic.to_vec()));
    }

    let version = reader.read_u32()?;
    if !(2..=3).contains(&version) {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let (tensor_count, metadata_kv_count) = if version >= 3 {
        (reader.read_u64()?, reader.read_u64()?)
    } else {
        (reader.read_u32()? as u64, reader.read_u32()? as u64)
    };

    let mut kv: HashMap<String, Value> = HashMap::new();
    for _ in 0..metadata_kv_count {
        let key = reader.read_string()?;
        let value_type = reader.read_u32()?;
        let value = read_value(&mut reader, value_type)?;
        kv.insert(key, value);
    }

    let mut descriptors = Vec::with_capacity(tensor_count as usize);
    let mut last_offset = 0u64;
    for _ in 0..tensor_count {
        let name = reader.read_string()?;
        let n_dims = reader.read_u32()?;
        let mut shape = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            shape.push(reader.read_u64()?);
        }
        let dtype_tag = reader.read_u32()?;
        let offset_within_data = reader.read_u64()?;

        if offset_within_data < last_offset {
            return Err(FormatError::OutOfOrderOffset {
                name,
                offset: offset_within_data,
                previous: last_offset,
            });
        }
        last_offset = offset_within_data;

        let dtype = DType::from_ggml_tag(dtype_tag)
            .ok_or_else(|| FormatError::UnknownDtype(format!("ggml type {dtype_tag}")))?;
        let num_elements: u64 = shape.iter().product();
        let byte_size = dtype.byte_size(num_elements);

        descriptors.push((name, shape, dtype, byte_size, offset_within_data));
    }

    // Align up to a 32-byte boundary; that offset is the tensor-data origin.
    let tensor_data_origin = (reader.pos).div_ceil(ALIGNMENT) * ALIGNMENT;

    let descriptors: Vec<TensorDescriptor> = descriptors
        .into_iter()
        .map(|(name, shape, dtype, byte_size, offset_within_data)| TensorDescriptor {
            name,
            shape,
            dtype,
            byte_size,
            byte_offset: tensor_data_origin as u64 + offset_within_data,
        })
        .collect();

    let architecture_name = kv.get("general.architecture").and_then(|v| v.as_string());
    let arch_prefix = architecture_name.clone().unwrap_or_default();

    let architecture = Architecture {
        name: architecture_name,
        hidden_size: kv
            .get(&format!("{arch_prefix}.embedding_length"))
            .and_then(|v| v.as_u64()),
        num_layers: kv
            .get(&format!("{arch_prefix}.block_count"))
            .and_then(|v| v.as_u64()),
        num_attention_heads: kv
            .get(&format!("{arch_prefix}.attention.head_count"))
            .and_then(|v| v.as_u64()),
        num_kv_heads: kv
            .get(&format!("{arch_prefix}.attention.head_count_kv"))
            .and_then(|v| v.as_u64()),
        vocab_size: kv
            .get("tokenizer.ggml.tokens")
            .and_then(|v| match v {
                Value::Array(items) => Some(items.len() as u64),
                _ => None,
            }),
        context_length: kv
            .get(&format!("{arch_prefix}.context_length"))
            .and_then(|v| v.as_u64()),
    };

    let moe_config = kv
        .get(&format!("{arch_prefix}.expert_count"))
        .and_then(|v| v.as_u64())
        .map(|expert_count| MoeConfig {
            expert_count,
            experts_per_token: kv
                .get(&format!("{arch_prefix}.expert_used_count"))
                .and_then(|v| v.as_u64()),
        });

    // general.file_type is a quant *preset* id, not a dtype tag; spec derives
    // quantization from tensor dtypes directly regardless of format.
    let quantization = super::pick_quantization(&descriptors);

    let mut metadata = HashMap::new();
    for (key, value) in &kv {
        if let Some(s) = value.as_string() {
            if s.len() <= 500 {
                metadata.insert(key.clone(), s);
            }
        }
    }

    Ok(ParsedContainer {
        descriptors,
        architecture,
        quantization,
        tensor_data_origin: tensor_data_origin as u64,
        moe_config,
        model_type: kv.get("general.name").and_then(|v| v.as_string()),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_header(version: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&0u64.to_le_bytes()); // metadata_kv_count
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = b"NOPE0000".to_vec();
        assert!(matches!(parse(&buf), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(parse(&buf), Err(FormatError::UnsupportedVersion(99))));
    }

    #[test]
    fn empty_model_yields_origin_at_32_bytes() {
        // Scenario 6: version 3, zero tensors, zero metadata entries → header
        // is 24 bytes, aligned up to 32.
        let buf = empty_header(3);
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.tensor_data_origin, 32);
        assert!(parsed.descriptors.is_empty());
    }

    #[test]
    fn truncated_input_reports_truncation() {
        let buf = vec![b'G', b'G', b'U', b'F', 3, 0]; // magic + partial version
        assert!(matches!(parse(&buf), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn tensor_offsets_become_absolute_from_origin() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&0u64.to_le_bytes()); // metadata_kv_count

        // tensor record: name "w", 2 dims [2,2], dtype F32 (0), offset 0
        let name = b"w";
        buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // F32
        buf.extend_from_slice(&0u64.to_le_bytes()); // offset_within_data

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.descriptors.len(), 1);
        let d = &parsed.descriptors[0];
        assert_eq!(d.byte_size, 16);
        assert_eq!(d.byte_offset, parsed.tensor_data_origin);
    }
}
