use std::collections::BTreeMap;

use candle_core::{DType, Device};
use diffusion_engine_backend::QuantizationPolicy;
use diffusion_engine_common::{Precision, ProgressTracker};
use tracing::{info, warn};

use crate::{
    adapters::AdapterState,
    config::PipelineConfig,
    error::{EngineError, Result},
    family::ComponentName,
    loader::{hub_options, ModelFetcher, ModelLoader, SharedModel},
    memory::{reclaim_memory, MemoryPlacement},
    prompt_cache::PromptCache,
    runtime::{PipelineRuntime, RuntimeBuilder, RuntimeSettings},
    scheduler::Sampler,
    util::resolve_precision,
};

/// Loaded sub-models of one pipeline.
#[derive(Clone, Default)]
pub struct PipelineParts {
    pub components: BTreeMap<ComponentName, SharedModel>,
    /// Control-net with the name it was configured under.
    pub control_net: Option<(String, SharedModel)>,
}

impl PipelineParts {
    pub fn get(&self, component: &ComponentName) -> Option<&SharedModel> {
        match component {
            ComponentName::ControlNet => self.control_net.as_ref().map(|(_, m)| m),
            other => self.components.get(other),
        }
    }
}

/// A runnable pipeline: sub-models, runtime, sampler and per-pipeline caches.
pub struct PipelineHandle {
    pub(crate) config: PipelineConfig,
    pub(crate) device: Device,
    pub(crate) dtype: DType,
    pub(crate) parts: PipelineParts,
    pub(crate) runtime: Box<dyn PipelineRuntime>,
    pub(crate) sampler: Sampler,
    pub(crate) adapters: AdapterState,
    pub(crate) prompt_cache: PromptCache,
    pub(crate) placement: MemoryPlacement,
}

impl PipelineHandle {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn component(&self, component: &ComponentName) -> Option<&SharedModel> {
        self.parts.get(component)
    }

    pub fn parts(&self) -> &PipelineParts {
        &self.parts
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn adapters(&self) -> &AdapterState {
        &self.adapters
    }

    pub fn placement(&self) -> MemoryPlacement {
        self.placement
    }

    pub fn runtime(&self) -> &dyn PipelineRuntime {
        self.runtime.as_ref()
    }
}

/// Composes sub-models, runtime and adapters into a [`PipelineHandle`].
pub struct PipelineAssembler<'a> {
    pub fetcher: &'a dyn ModelFetcher,
    pub builder: &'a dyn RuntimeBuilder,
    pub policy: &'a QuantizationPolicy,
}

impl PipelineAssembler<'_> {
    pub fn build(
        &self,
        config: PipelineConfig,
        tracker: &mut ProgressTracker,
    ) -> Result<PipelineHandle> {
        self.assemble(config, None, tracker)
    }

    /// Reassemble `existing` under `config`, reusing every sub-model it already holds.
    ///
    /// Baked adapters are detached first. On failure they are re-attached and `existing`
    /// stays usable.
    pub fn rebuild(
        &self,
        config: PipelineConfig,
        existing: &mut PipelineHandle,
        tracker: &mut ProgressTracker,
    ) -> Result<PipelineHandle> {
        existing.config.reload_compatible(&config)?;
        let baked = existing
            .adapters
            .detach(existing.runtime.as_mut())
            .map_err(|e| EngineError::model_load("lora_adapters", e))?;
        existing.prompt_cache.invalidate();

        match self.assemble(config, Some(&existing.parts), tracker) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(reattach) = existing
                    .adapters
                    .attach_all(existing.runtime.as_mut(), &baked)
                {
                    warn!("[Load] Could not restore adapters after a failed reload: {reattach}");
                }
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        config: PipelineConfig,
        reuse: Option<&PipelineParts>,
        tracker: &mut ProgressTracker,
    ) -> Result<PipelineHandle> {
        let family = config.pipeline;
        let descriptor = family.descriptor();
        if !family.supports(config.process_type) {
            return Err(EngineError::UnsupportedProcessType {
                family,
                process_type: config.process_type,
            });
        }
        if config.control_net.is_some() && !descriptor.control_net {
            return Err(EngineError::Configuration(format!(
                "{family} does not support control-nets"
            )));
        }

        let device = config
            .device
            .resolve(config.device_id)
            .map_err(|e| EngineError::Configuration(format!("device {}: {e}", config.device)))?;
        let dtype = resolve_precision(config.data_type, &device, config.is_silent)?;
        let precision = match config.data_type {
            Precision::Auto => Precision::from(dtype),
            other => other,
        };

        tracker.reset(family.total_models(config.control_net.is_some()));
        let mut parts = PipelineParts::default();
        {
            let mut loader = ModelLoader {
                config: &config,
                fetcher: self.fetcher,
                policy: self.policy,
                tracker: &mut *tracker,
                device: &device,
                precision,
                dtype,
                hub: hub_options(&config),
            };
            for (index, component) in descriptor.components.iter().enumerate() {
                let existing = reuse.and_then(|p| p.components.get(component));
                let model = loader.load(component, index, existing)?;
                parts.components.insert(component.clone(), model);
            }
            if let Some(control_net) = &config.control_net {
                let existing = reuse.and_then(|p| p.control_net.as_ref());
                parts.control_net = Some(loader.load_control_net(
                    control_net,
                    descriptor.components.len(),
                    existing,
                )?);
            }
        }
        tracker.finish();
        tracker.clear();

        let settings = RuntimeSettings { precision, dtype };
        let mut runtime = self
            .builder
            .assemble(family, config.process_type, &parts, &device, settings)
            .map_err(|e| EngineError::model_load("pipeline", e))?;

        let placement = MemoryPlacement::from_mode(config.memory_mode);
        runtime
            .configure_memory(&placement, &device)
            .map_err(|e| EngineError::model_load("pipeline", e))?;

        let mut adapters = AdapterState::default();
        adapters
            .attach_all(runtime.as_mut(), &config.lora_adapters)
            .map_err(|e| EngineError::model_load("lora_adapters", e))?;

        let sampler = runtime.default_sampler();
        reclaim_memory(Some(runtime.as_mut()), placement.is_offload());
        info!(
            "[Load] {family} pipeline ready for {}, memory mode {}",
            config.process_type, config.memory_mode
        );

        Ok(PipelineHandle {
            prompt_cache: PromptCache::new(descriptor.prompt_cache),
            config,
            device,
            dtype,
            parts,
            runtime,
            sampler,
            adapters,
            placement,
        })
    }
}
