use std::{fmt::Display, str::FromStr};

use candle_core::{Device, Result};
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::error::EngineError;

/// Accelerator family requested by a pipeline configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    #[default]
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Open device `ordinal` of this kind. CUDA falls back to the CPU when the
    /// build or the host has no CUDA support.
    pub fn resolve(&self, ordinal: usize) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => {
                let device = Device::cuda_if_available(ordinal)?;
                if device.is_cpu() {
                    info!("CUDA device {ordinal} is not available, using the CPU.");
                }
                Ok(device)
            }
            Self::Metal => Device::new_metal(ordinal),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => Err(EngineError::Configuration(format!(
                "unrecognized device `{other}`"
            ))),
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
