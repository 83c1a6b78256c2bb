use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device};
use diffusion_engine_backend::{QuantizationConfig, QuantizationPolicy, QuantizedModel};
use diffusion_engine_common::{
    ComponentFiles, DownloadCallback, FileLoader, HubOptions, ModelSource, Precision,
    ProgressTracker, TokenSource,
};
use tracing::{debug, info};

use crate::{
    config::{ControlNetConfig, PipelineConfig},
    error::{EngineError, Result},
    family::{ComponentName, PipelineFamily},
};

/// A loaded sub-model: text encoder, denoiser, autoencoder or control-net.
pub trait SubModel: QuantizedModel + Send {
    /// Precision the weights are currently stored in.
    fn precision(&self) -> Precision;

    fn is_gguf(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Sub-models are shared by reference so a reload can move them into the new handle.
pub type SharedModel = Arc<Mutex<dyn SubModel>>;

/// How the fetcher should quantize while loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadQuantization {
    None,
    /// Quantize while loading, per the backend's declarative config.
    Declarative(QuantizationConfig),
    /// Pre-quantized GGUF weights computing in this precision.
    GgufCompute(Precision),
}

pub struct FetchRequest<'a> {
    pub family: PipelineFamily,
    pub component: &'a ComponentName,
    pub source: ModelSource,
    pub subfolder: Option<String>,
    pub precision: Precision,
    pub dtype: DType,
    pub variant: Option<&'a str>,
    pub hub: &'a HubOptions,
    pub device: &'a Device,
    pub quantization: LoadQuantization,
}

/// Retrieves and instantiates one sub-model, reporting byte progress through `progress`.
pub trait ModelFetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        progress: &mut DownloadCallback<'_>,
    ) -> anyhow::Result<SharedModel>;
}

/// Instantiates a sub-model from files already on disk.
pub trait ModelFactory: Send + Sync {
    fn build(&self, request: &FetchRequest<'_>, files: &ComponentFiles)
        -> anyhow::Result<SharedModel>;
}

/// [`ModelFetcher`] over the Hugging Face hub (or a local diffusers-layout directory).
pub struct HubFetcher<F> {
    factory: F,
}

impl<F: ModelFactory> HubFetcher<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: ModelFactory> ModelFetcher for HubFetcher<F> {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        progress: &mut DownloadCallback<'_>,
    ) -> anyhow::Result<SharedModel> {
        let loader = FileLoader::from_model_source(&request.source, request.hub)?;
        let files =
            loader.resolve_component(request.subfolder.as_deref(), request.variant, progress)?;
        debug!(
            "[Load] {}: {} weight file(s), config: {}",
            request.component,
            files.weights.len(),
            files.config.is_some()
        );
        self.factory.build(request, &files)
    }
}

pub(crate) fn hub_options(config: &PipelineConfig) -> HubOptions {
    HubOptions {
        token: Some(TokenSource::from_secure_token(
            config.secure_token.as_deref(),
        )),
        revision: None,
        cache_dir: config.cache_directory.clone(),
        silent: config.is_silent,
    }
}

/// Loads the sub-models of one pipeline, in order, into the shared progress tracker.
pub struct ModelLoader<'a> {
    pub(crate) config: &'a PipelineConfig,
    pub(crate) fetcher: &'a dyn ModelFetcher,
    pub(crate) policy: &'a QuantizationPolicy,
    pub(crate) tracker: &'a mut ProgressTracker,
    pub(crate) device: &'a Device,
    pub(crate) precision: Precision,
    pub(crate) dtype: DType,
    pub(crate) hub: HubOptions,
}

impl ModelLoader<'_> {
    /// Precision quantization should target. An unset request means the native precision.
    fn requested_precision(&self) -> Precision {
        let requested = self.config.quant_data_type;
        if requested == self.config.data_type || requested == Precision::Auto {
            self.precision
        } else {
            requested
        }
    }

    fn fetch(
        &mut self,
        component: &ComponentName,
        source: ModelSource,
        subfolder: Option<String>,
        quantization: LoadQuantization,
    ) -> Result<SharedModel> {
        let request = FetchRequest {
            family: self.config.pipeline,
            component,
            source,
            subfolder,
            precision: self.precision,
            dtype: self.dtype,
            variant: self.config.variant.as_deref(),
            hub: &self.hub,
            device: self.device,
            quantization,
        };
        let tracker = &mut *self.tracker;
        let mut progress =
            |file: &str, done: u64, total: u64, rate: f64| tracker.update(file, done, total, rate);
        self.fetcher
            .fetch(&request, &mut progress)
            .map_err(|e| EngineError::model_load(component, e))
    }

    /// Load `component` as progress model `index`, or reuse `existing` as-is.
    pub fn load(
        &mut self,
        component: &ComponentName,
        index: usize,
        existing: Option<&SharedModel>,
    ) -> Result<SharedModel> {
        let name = component.to_string();
        self.tracker.initialize(index, &name);
        if let Some(model) = existing {
            info!("[Load] Loading cached {name}");
            return Ok(model.clone());
        }

        let role = component.role();
        let mode = self.config.memory_mode;
        let requested = self.requested_precision();

        if let Some(path) = self.config.checkpoint_config.for_role(role) {
            info!("[Load] Loading checkpoint {name}");
            let source = ModelSource::single_file(path);
            let gguf = source.is_gguf();
            let quantization = if gguf {
                LoadQuantization::GgufCompute(self.precision)
            } else {
                LoadQuantization::None
            };
            let model = self.fetch(component, source, None, quantization)?;
            if !gguf && role.is_quantizable() {
                let mut guard = model.lock().map_err(|_| {
                    EngineError::model_load(component, anyhow::anyhow!("sub-model lock poisoned"))
                })?;
                if !guard.is_gguf() {
                    self.policy
                        .quantize_model(&mut *guard, self.precision, requested, mode)
                        .map_err(|e| EngineError::model_load(component, e))?;
                }
            }
            return Ok(model);
        }

        info!("[Load] Loading {name}");
        let quantization = if role.is_quantizable() {
            self.policy
                .model_config(self.precision, requested, mode)
                .map_or(LoadQuantization::None, LoadQuantization::Declarative)
        } else {
            LoadQuantization::None
        };
        let source = ModelSource::from_model_id(&self.config.base_model_path);
        self.fetch(component, source, component.subfolder(), quantization)
    }

    /// Load a control-net, reusing `existing` when it carries the same name.
    pub fn load_control_net(
        &mut self,
        control_net: &ControlNetConfig,
        index: usize,
        existing: Option<&(String, SharedModel)>,
    ) -> Result<(String, SharedModel)> {
        let reuse = existing
            .filter(|(name, _)| *name == control_net.name)
            .map(|(_, model)| model);
        if reuse.is_some() {
            let model = self.load(&ComponentName::ControlNet, index, reuse)?;
            return Ok((control_net.name.clone(), model));
        }

        self.tracker.initialize(index, &ComponentName::ControlNet.to_string());
        info!("[Load] Loading ControlNet {}", control_net.name);
        let source = if control_net.is_single_file() {
            ModelSource::single_file(&control_net.path)
        } else {
            ModelSource::from_model_id(&control_net.path)
        };
        let model = self.fetch(
            &ComponentName::ControlNet,
            source,
            None,
            LoadQuantization::None,
        )?;
        Ok((control_net.name.clone(), model))
    }
}
