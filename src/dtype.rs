//! Closed tag set of tensor element types shared by both container formats.

use serde::{Deserialize, Serialize};

/// One entry of the closed dtype set described in the data model: floating,
/// integer, and block-quantized families. Block-quantized variants carry
/// their GGML block geometry so `byte_size` can be derived without a lookup
/// table at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
    Iq1S,
    Iq1M,
    Iq2Xxs,
    Iq2Xs,
    Iq2S,
    Iq3Xxs,
    Iq3S,
    Iq4Nl,
    Iq4Xs,
}

impl DType {
    /// `(elements_per_block, bytes_per_block)`. For non-quantized types the
    /// block is a single element.
    pub fn block_geometry(self) -> (u64, u64) {
        use DType::*;
        match self {
            F64 => (1, 8),
            F32 => (1, 4),
            F16 | BF16 => (1, 2),
            I64 => (1, 8),
            I32 => (1, 4),
            I16 => (1, 2),
            I8 | U8 | Bool => (1, 1),
            Q4_0 => (32, 18),
            Q4_1 => (32, 20),
            Q5_0 => (32, 22),
            Q5_1 => (32, 24),
            Q8_0 => (32, 34),
            Q8_1 => (32, 36),
            Q2K => (256, 84),
            Q3K => (256, 110),
            Q4K => (256, 144),
            Q5K => (256, 176),
            Q6K => (256, 210),
            Q8K => (256, 292),
            Iq1S => (256, 50),
            Iq1M => (256, 56),
            Iq2Xxs => (256, 66),
            Iq2Xs => (256, 74),
            Iq2S => (256, 82),
            Iq3Xxs => (256, 98),
            Iq3S => (256, 110),
            Iq4Nl => (32, 18),
            Iq4Xs => (256, 136),
        }
    }

    /// `ceil(num_elements / block_size) * bytes_per_block`, the invariant
    /// spec'd for block-quantized byte size (and, trivially, for dense
    /// types where block_size == 1).
    pub fn byte_size(self, num_elements: u64) -> u64 {
        let (block_size, bytes_per_block) = self.block_geometry();
        let num_blocks = num_elements.div_ceil(block_size);
        num_blocks * bytes_per_block
    }

    pub fn as_str(self) -> &'static str {
        use DType::*;
        match self {
            F64 => "F64",
            F32 => "F32",
            F16 => "F16",
            BF16 => "BF16",
            I64 => "I64",
            I32 => "I32",
            I16 => "I16",
            I8 => "I8",
            U8 => "U8",
            Bool => "BOOL",
            Q4_0 => "Q4_0",
            Q4_1 => "Q4_1",
            Q5_0 => "Q5_0",
            Q5_1 => "Q5_1",
            Q8_0 => "Q8_0",
            Q8_1 => "Q8_1",
            Q2K => "Q2_K",
            Q3K => "Q3_K",
            Q4K => "Q4_K",
            Q5K => "Q5_K",
            Q6K => "Q6_K",
            Q8K => "Q8_K",
            Iq1S => "IQ1_S",
            Iq1M => "IQ1_M",
            Iq2Xxs => "IQ2_XXS",
            Iq2Xs => "IQ2_XS",
            Iq2S => "IQ2_S",
            Iq3Xxs => "IQ3_XXS",
            Iq3S => "IQ3_S",
            Iq4Nl => "IQ4_NL",
            Iq4Xs => "IQ4_XS",
        }
    }

    pub fn from_str_tag(s: &str) -> Option<Self> {
        use DType::*;
        Some(match s {
            "F64" => F64,
            "F32" => F32,
            "F16" => F16,
            "BF16" => BF16,
            "I64" => I64,
            "I32" => I32,
            "I16" => I16,
            "I8" => I8,
            "U8" => U8,
            "BOOL" => Bool,
            "Q4_0" => Q4_0,
            "Q4_1" => Q4_1,
            "Q5_0" => Q5_0,
            "Q5_1" => Q5_1,
            "Q8_0" => Q8_0,
            "Q8_1" => Q8_1,
            "Q2_K" => Q2K,
            "Q3_K" => Q3K,
            "Q4_K" => Q4K,
            "Q5_K" => Q5K,
            "Q6_K" => Q6K,
            "Q8_K" => Q8K,
            "IQ1_S" => Iq1S,
            "IQ1_M" => Iq1M,
            "IQ2_XXS" => Iq2Xxs,
            "IQ2_XS" => Iq2Xs,
            "IQ2_S" => Iq2S,
            "IQ3_XXS" => Iq3Xxs,
            "IQ3_S" => Iq3S,
            "IQ4_NL" => Iq4Nl,
            "IQ4_XS" => Iq4Xs,
            _ => return None,
        })
    }

    /// GGML tensor dtype tags as used in Format G tensor records.
    pub fn from_ggml_tag(tag: u32) -> Option<Self> {
        use DType::*;
        Some(match tag {
            0 => F32,
            1 => F16,
            2 => Q4_0,
            3 => Q4_1,
            6 => Q5_0,
            7 => Q5_1,
            8 => Q8_0,
            9 => Q8_1,
            10 => Q2K,
            11 => Q3K,
            12 => Q4K,
            13 => Q5K,
            14 => Q6K,
            15 => Q8K,
            16 => Iq2Xxs,
            17 => Iq2Xs,
            18 => Iq3Xxs,
            19 => Iq1S,
            20 => Iq4Nl,
            21 => Iq3S,
            22 => Iq2S,
            23 => Iq4Xs,
            24 => I8,
            25 => I16,
            26 => I32,
            27 => I64,
            28 => F64,
            29 => Iq1M,
            30 => BF16,
            _ => return None,
        })
    }
}

impl Serialize for DType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DType::from_str_tag(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown dtype {s}")))
    }
}
