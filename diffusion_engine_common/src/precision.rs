use std::{fmt::Display, str::FromStr};

use candle_core::DType;
use serde::{Deserialize, Deserializer};

/// Canonical numeric precision tag for weights and activations.
///
/// Parsed from the loose aliases callers send (`"bfloat16"`, `"bf16"`, `"fp8"`...).
/// `Auto` is resolved against the target device when a pipeline is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    Auto,
    F32,
    F16,
    #[default]
    BF16,
    F8E4M3,
    F8E5M2,
    Int8,
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized precision `{0}`")]
pub struct UnknownPrecision(pub String);

impl FromStr for Precision {
    type Err = UnknownPrecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "float32" | "float" | "fp32" | "f32" => Ok(Self::F32),
            "float16" | "half" | "fp16" | "f16" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            "float8" | "float8_e4m3fn" | "fp8" | "f8e4m3" => Ok(Self::F8E4M3),
            "float8_e5m2" | "f8e5m2" => Ok(Self::F8E5M2),
            "int8" | "qint8" => Ok(Self::Int8),
            _ => Err(UnknownPrecision(s.to_string())),
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::F32 => write!(f, "float32"),
            Self::F16 => write!(f, "float16"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::F8E4M3 => write!(f, "float8_e4m3fn"),
            Self::F8E5M2 => write!(f, "float8_e5m2"),
            Self::Int8 => write!(f, "int8"),
        }
    }
}

impl<'de> Deserialize<'de> for Precision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Precision {
    /// The candle compute dtype, if this precision can be computed in directly.
    ///
    /// Storage-only precisions (float8, int8) and `Auto` return `None`.
    pub fn compute_dtype(&self) -> Option<DType> {
        match self {
            Self::F32 => Some(DType::F32),
            Self::F16 => Some(DType::F16),
            Self::BF16 => Some(DType::BF16),
            Self::Auto | Self::F8E4M3 | Self::F8E5M2 | Self::Int8 => None,
        }
    }

    pub fn is_float8(&self) -> bool {
        matches!(self, Self::F8E4M3 | Self::F8E5M2)
    }
}

impl From<DType> for Precision {
    fn from(value: DType) -> Self {
        match value {
            DType::F16 => Self::F16,
            DType::BF16 => Self::BF16,
            _ => Self::F32,
        }
    }
}
