use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer};

/// How a pipeline's weights are placed between accelerator and host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// Whole pipeline on the device.
    Device,
    /// Whole pipeline on the device, VAE sliced and tiled.
    LowMemDevice,
    /// Each sub-model moved to the device only while its phase runs.
    OffloadModel,
    /// Model-level offload, VAE sliced and tiled.
    LowMemOffloadModel,
    /// Each layer moved to the device only while it executes.
    OffloadCPU,
    /// Sub-models spread over several devices.
    MultiDevice,
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized memory mode `{0}`")]
pub struct UnknownMemoryMode(pub String);

impl FromStr for MemoryMode {
    type Err = UnknownMemoryMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Device" => Ok(Self::Device),
            "LowMemDevice" => Ok(Self::LowMemDevice),
            "OffloadModel" => Ok(Self::OffloadModel),
            "LowMemOffloadModel" => Ok(Self::LowMemOffloadModel),
            "OffloadCPU" => Ok(Self::OffloadCPU),
            "MultiDevice" => Ok(Self::MultiDevice),
            other => Err(UnknownMemoryMode(other.to_string())),
        }
    }
}

impl Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Device => "Device",
            Self::LowMemDevice => "LowMemDevice",
            Self::OffloadModel => "OffloadModel",
            Self::LowMemOffloadModel => "LowMemOffloadModel",
            Self::OffloadCPU => "OffloadCPU",
            Self::MultiDevice => "MultiDevice",
        };
        write!(f, "{name}")
    }
}

impl<'de> Deserialize<'de> for MemoryMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl MemoryMode {
    pub fn is_low_memory(&self) -> bool {
        matches!(self, Self::LowMemDevice | Self::LowMemOffloadModel)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryMode;

    #[test]
    fn names_round_trip() {
        for name in [
            "Device",
            "LowMemDevice",
            "OffloadModel",
            "LowMemOffloadModel",
            "OffloadCPU",
            "MultiDevice",
        ] {
            assert_eq!(name.parse::<MemoryMode>().unwrap().to_string(), name);
        }
    }

    #[test]
    fn unknown_and_miscased_names_are_rejected() {
        assert!("offloadcpu".parse::<MemoryMode>().is_err());
        assert!("Cpu".parse::<MemoryMode>().is_err());
        let err = serde_json::from_str::<MemoryMode>("\"Sharded\"").unwrap_err();
        assert!(err.to_string().contains("Sharded"));
    }

    #[test]
    fn low_memory_variants() {
        assert!(MemoryMode::LowMemDevice.is_low_memory());
        assert!(MemoryMode::LowMemOffloadModel.is_low_memory());
        assert!(!MemoryMode::OffloadCPU.is_low_memory());
    }
}
