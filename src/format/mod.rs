//! Container parsers (spec §4.A). Both formats expose the same
//! [`ParsedContainer`] output and are pure: they consume only the header
//! region and never touch tensor bulk data.

pub mod gguf;
pub mod safetensors;

use std::collections::HashMap;

use crate::dtype::DType;
use crate::manifest::{Architecture, MoeConfig, TensorDescriptor};

#[derive(Debug, Clone)]
pub struct ParsedContainer {
    pub descriptors: Vec<TensorDescriptor>,
    pub architecture: Architecture,
    pub quantization: DType,
    pub tensor_data_origin: u64,
    pub moe_config: Option<MoeConfig>,
    pub model_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Choose the dtype with the largest cumulative byte size across all
/// non-embedding, non-output tensors; ties break by iteration (insertion)
/// order, matching spec §4.A.
pub fn pick_quantization(descriptors: &[TensorDescriptor]) -> DType {
    let is_embedding_or_output = |name: &str| {
        let lower = name.to_lowercase();
        lower.contains("embed") || lower.contains("lm_head") || lower.contains("output")
    };

    let mut totals: Vec<(DType, u64)> = Vec::new();
    for d in descriptors {
        if is_embedding_or_output(&d.name) {
            continue;
        }
        if let Some(entry) = totals.iter_mut().find(|(dt, _)| *dt == d.dtype) {
            entry.1 += d.byte_size;
        } else {
            totals.push((d.dtype, d.byte_size));
        }
    }

    let mut best: Option<(DType, u64)> = None;
    for (dt, total) in totals {
        match best {
            Some((_, best_total)) if total <= best_total => {}
            _ => best = Some((dt, total)),
        }
    }
    best.map(|(dt, _)| dt).unwrap_or(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, dtype: DType, byte_size: u64) -> TensorDescriptor {
        TensorDescriptor {
            name: name.into(),
            shape: vec![1],
            dtype,
            byte_size,
            byte_offset: 0,
        }
    }

    #[test]
    fn quantization_excludes_embedding_and_output_tensors() {
        let descriptors = vec![
            desc("token_embed.weight", DType::F32, 1_000_000),
            desc("blk.0.attn.weight", DType::Q4K, 100),
            desc("blk.1.attn.weight", DType::Q4K, 100),
            desc("output.weight", DType::F32, 1_000_000),
        ];
        assert_eq!(pick_quantization(&descriptors), DType::Q4K);
    }

    #[test]
    fn quantization_ties_break_by_iteration_order() {
        let descriptors = vec![desc("a", DType::F16, 10), desc("b", DType::BF16, 10)];
        assert_eq!(pick_quantization(&descriptors), DType::F16);
    }
}
