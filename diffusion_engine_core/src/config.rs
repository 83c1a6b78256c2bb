use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use diffusion_engine_common::{is_gguf_path, is_single_file_path, MemoryMode, Precision};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    error::{EngineError, Result},
    family::{ComponentRole, PipelineFamily, ProcessType},
    scheduler::SchedulerOptions,
    util::DeviceKind,
};

/// Local checkpoint files that replace the repository copy of a sub-model.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointConfig {
    pub model_checkpoint: Option<PathBuf>,
    pub text_encoder_checkpoint: Option<PathBuf>,
    pub vae_checkpoint: Option<PathBuf>,
}

impl CheckpointConfig {
    pub fn for_role(&self, role: ComponentRole) -> Option<&Path> {
        match role {
            ComponentRole::TextEncoder => self.text_encoder_checkpoint.as_deref(),
            ComponentRole::Denoiser => self.model_checkpoint.as_deref(),
            ComponentRole::Autoencoder | ComponentRole::SecondaryAutoencoder => {
                self.vae_checkpoint.as_deref()
            }
            ComponentRole::ControlNet => None,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Path> {
        [
            &self.model_checkpoint,
            &self.text_encoder_checkpoint,
            &self.vae_checkpoint,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoraAdapter {
    pub path: String,
    pub name: String,
    /// Weight file inside `path`.
    #[serde(alias = "weight_file", alias = "weight_name")]
    pub weights: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlNetConfig {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawControlNet {
    path: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPipelineConfig {
    base_model_path: String,
    pipeline: PipelineFamily,
    process_type: ProcessType,
    memory_mode: MemoryMode,
    #[serde(default = "default_device")]
    device: DeviceKind,
    #[serde(default)]
    device_id: usize,
    #[serde(default)]
    data_type: Precision,
    #[serde(default)]
    quant_data_type: Option<Precision>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    cache_directory: Option<PathBuf>,
    #[serde(default)]
    secure_token: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    checkpoint_config: CheckpointConfig,
    #[serde(default, deserialize_with = "null_as_default")]
    lora_adapters: Vec<LoraAdapter>,
    #[serde(default)]
    control_net: Option<RawControlNet>,
    #[serde(default)]
    control_net_path: Option<String>,
    #[serde(default)]
    is_silent: bool,
}

fn default_device() -> DeviceKind {
    DeviceKind::Cuda
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A validated pipeline instantiation request.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub base_model_path: String,
    pub pipeline: PipelineFamily,
    pub process_type: ProcessType,
    pub memory_mode: MemoryMode,
    pub device: DeviceKind,
    pub device_id: usize,
    pub data_type: Precision,
    /// Only honored when it differs from `data_type` and the memory mode is not `OffloadCPU`.
    pub quant_data_type: Precision,
    pub variant: Option<String>,
    pub cache_directory: Option<PathBuf>,
    pub secure_token: Option<String>,
    pub checkpoint_config: CheckpointConfig,
    pub lora_adapters: Vec<LoraAdapter>,
    pub control_net: Option<ControlNetConfig>,
    pub is_silent: bool,
}

impl PipelineConfig {
    pub fn from_value(payload: &Value) -> Result<Self> {
        let raw = RawPipelineConfig::deserialize(payload)?;
        Self::try_from(raw)
    }

    /// Any declared checkpoint is a GGUF file.
    pub fn is_gguf(&self) -> bool {
        self.checkpoint_config.iter().any(is_gguf_path)
    }

    /// The sub-model with this role loads from a local checkpoint instead of the repository.
    pub fn is_single_file(&self, role: ComponentRole) -> bool {
        self.checkpoint_config.for_role(role).is_some()
    }

    /// The precision quantization would target, if this request asks for any.
    pub fn effective_quantization(&self) -> Option<Precision> {
        (self.quant_data_type != self.data_type && self.memory_mode != MemoryMode::OffloadCPU)
            .then_some(self.quant_data_type)
    }

    /// Fields a reload may change; everything else needs a fresh configure.
    pub(crate) fn reload_compatible(&self, other: &Self) -> Result<()> {
        let mut changed = Vec::new();
        if self.base_model_path != other.base_model_path {
            changed.push("base_model_path");
        }
        if self.pipeline != other.pipeline {
            changed.push("pipeline");
        }
        if self.memory_mode != other.memory_mode {
            changed.push("memory_mode");
        }
        if self.device != other.device || self.device_id != other.device_id {
            changed.push("device");
        }
        if self.data_type != other.data_type || self.quant_data_type != other.quant_data_type {
            changed.push("data_type");
        }
        if self.variant != other.variant {
            changed.push("variant");
        }
        if self.checkpoint_config != other.checkpoint_config {
            changed.push("checkpoint_config");
        }
        if changed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Configuration(format!(
                "reload cannot change {}; configure a new pipeline instead",
                changed.join(", ")
            )))
        }
    }
}

impl TryFrom<RawPipelineConfig> for PipelineConfig {
    type Error = EngineError;

    fn try_from(raw: RawPipelineConfig) -> Result<Self> {
        if raw.base_model_path.trim().is_empty() {
            return Err(EngineError::configuration("`base_model_path` is empty"));
        }

        let mut seen = HashSet::new();
        for adapter in &raw.lora_adapters {
            if !seen.insert(adapter.name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate lora adapter name `{}`",
                    adapter.name
                )));
            }
        }

        let control_net = match (raw.control_net.unwrap_or_default(), raw.control_net_path) {
            (RawControlNet { path: Some(path), name }, _) => Some(control_net(path, name)),
            (RawControlNet { path: None, name: Some(name) }, _) => {
                return Err(EngineError::Configuration(format!(
                    "control net `{name}` has no path"
                )))
            }
            (RawControlNet { path: None, name: None }, Some(path)) => Some(control_net(path, None)),
            (RawControlNet { path: None, name: None }, None) => None,
        };

        Ok(Self {
            base_model_path: raw.base_model_path,
            pipeline: raw.pipeline,
            process_type: raw.process_type,
            memory_mode: raw.memory_mode,
            device: raw.device,
            device_id: raw.device_id,
            data_type: raw.data_type,
            quant_data_type: raw.quant_data_type.unwrap_or(raw.data_type),
            variant: raw.variant.filter(|v| !v.is_empty()),
            cache_directory: raw.cache_directory,
            secure_token: raw.secure_token.filter(|t| !t.is_empty()),
            checkpoint_config: raw.checkpoint_config,
            lora_adapters: raw.lora_adapters,
            control_net,
            is_silent: raw.is_silent,
        })
    }
}

fn control_net(path: String, name: Option<String>) -> ControlNetConfig {
    let name = name.unwrap_or_else(|| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone())
    });
    ControlNetConfig { path, name }
}

impl ControlNetConfig {
    pub fn is_single_file(&self) -> bool {
        is_single_file_path(&self.path)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoraOption {
    pub name: String,
    pub strength: f64,
}

fn lora_options<'de, D>(deserializer: D) -> std::result::Result<Vec<LoraOption>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<LoraOption>),
        Map(BTreeMap<String, f64>),
    }
    Ok(match Option::<Repr>::deserialize(deserializer)? {
        Some(Repr::List(list)) => list,
        Some(Repr::Map(map)) => map
            .into_iter()
            .map(|(name, strength)| LoraOption { name, strength })
            .collect(),
        None => Vec::new(),
    })
}

fn default_one() -> f64 {
    1.0
}

fn default_steps() -> usize {
    50
}

fn default_scheduler() -> String {
    "ddim".to_string()
}

/// Per-call generation options.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PipelineOptions {
    pub seed: u64,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_one")]
    pub guidance_scale: f64,
    #[serde(default = "default_one")]
    pub guidance_scale2: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default)]
    pub steps2: usize,
    #[serde(default)]
    pub height: usize,
    #[serde(default)]
    pub width: usize,
    #[serde(default)]
    pub frames: usize,
    #[serde(default)]
    pub frame_rate: f64,
    #[serde(default = "default_one")]
    pub strength: f64,
    #[serde(default = "default_one")]
    pub control_net_scale: f64,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub scheduler_options: SchedulerOptions,
    #[serde(default, deserialize_with = "lora_options")]
    pub lora_options: Vec<LoraOption>,
    #[serde(default)]
    pub temp_filename: Option<PathBuf>,
}

impl PipelineOptions {
    pub fn from_value(payload: &Value) -> Result<Self> {
        let options = Self::deserialize(payload)?;
        if options.steps == 0 {
            return Err(EngineError::configuration("`steps` must be at least 1"));
        }
        for lora in &options.lora_options {
            if !lora.strength.is_finite() {
                return Err(EngineError::Configuration(format!(
                    "lora `{}` strength is not finite",
                    lora.name
                )));
            }
        }
        Ok(options)
    }

    /// Classifier-free guidance is enabled.
    pub fn guidance_enabled(&self) -> bool {
        self.guidance_scale > 1.0
    }
}
