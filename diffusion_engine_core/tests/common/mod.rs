#![allow(dead_code)]

use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use diffusion_engine_backend::{
    unquantized_layer, GgmlBackend, QuantMethod, QuantizedModel, QuantizedModelLayer,
};
use diffusion_engine_common::DownloadCallback;
use diffusion_engine_core::{
    DenoiseLoop, DenoiseOutcome, Engine, FetchRequest, GenerationOutput, GenerationRequest,
    LoadQuantization, LoraAdapter, LoraOption, MemoryPlacement, ModelFetcher, ModelSource,
    OutputKind, PipelineFamily, PipelineParts, PipelineRuntime, Precision, ProcessType,
    PromptEmbeddings, PromptRequest, QuantizationPolicy, RuntimeBuilder, RuntimeSettings, Sampler,
    SamplerKind, SchedulerOptions, SharedModel, StepCallback, SubModel,
};
use serde_json::{json, Value};

/// One weight matrix standing in for a whole sub-model.
pub struct FakeModel {
    pub layers: Vec<Arc<dyn QuantMethod>>,
}

impl FakeModel {
    pub fn new() -> candle_core::Result<Self> {
        let w = Tensor::ones((8, 64), DType::F32, &Device::Cpu)?;
        Ok(Self {
            layers: vec![unquantized_layer(w, None)?],
        })
    }
}

impl QuantizedModel for FakeModel {
    fn match_devices_all_layers(&mut self, _dev: &Device) -> candle_core::Result<()> {
        Ok(())
    }

    fn aggregate_layers(&mut self) -> candle_core::Result<Vec<QuantizedModelLayer>> {
        Ok(vec![QuantizedModelLayer(self.layers.iter_mut().collect())])
    }
}

impl SubModel for FakeModel {
    fn precision(&self) -> Precision {
        self.layers[0].precision()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type StepHook = Box<dyn Fn(usize) + Send>;

/// Shared record of everything the fakes were asked to do.
#[derive(Default)]
pub struct Probe {
    pub fetches: Mutex<Vec<(String, ModelSource, LoadQuantization)>>,
    pub fail_component: Mutex<Option<String>>,
    pub encodes: AtomicUsize,
    pub steps: AtomicUsize,
    pub empty_cache: AtomicUsize,
    pub events: Mutex<Vec<String>>,
    pub placements: Mutex<Vec<MemoryPlacement>>,
    pub step_hook: Mutex<Option<StepHook>>,
}

impl Probe {
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetched(&self, component: &str) -> Vec<LoadQuantization> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == component)
            .map(|(_, _, q)| *q)
            .collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_step_hook(&self, hook: impl Fn(usize) + Send + 'static) {
        *self.step_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_on(&self, component: &str) {
        *self.fail_component.lock().unwrap() = Some(component.to_string());
    }

    fn event(&self, e: impl Into<String>) {
        self.events.lock().unwrap().push(e.into());
    }
}

pub struct FakeFetcher(pub Arc<Probe>);

impl ModelFetcher for FakeFetcher {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        progress: &mut DownloadCallback<'_>,
    ) -> Result<SharedModel> {
        let name = request.component.to_string();
        if self.0.fail_component.lock().unwrap().as_deref() == Some(name.as_str()) {
            anyhow::bail!("repository has no `{name}` folder");
        }
        self.0
            .fetches
            .lock()
            .unwrap()
            .push((name, request.source.clone(), request.quantization));
        progress("model.safetensors", 512, 1024, 10.0);
        progress("model.safetensors", 1024, 1024, 10.0);
        let model: SharedModel = Arc::new(Mutex::new(FakeModel::new()?));
        Ok(model)
    }
}

pub struct FakeRuntime {
    probe: Arc<Probe>,
    family: PipelineFamily,
}

impl PipelineRuntime for FakeRuntime {
    fn default_sampler(&self) -> Sampler {
        let opts = SchedulerOptions {
            shift: 3.0,
            ..Default::default()
        };
        Sampler::new(SamplerKind::FlowMatchEulerDiscrete, &opts)
    }

    fn configure_memory(&mut self, placement: &MemoryPlacement, _device: &Device) -> Result<()> {
        self.probe.placements.lock().unwrap().push(*placement);
        Ok(())
    }

    fn attach_adapter(&mut self, adapter: &LoraAdapter) -> Result<()> {
        self.probe.event(format!("attach {}", adapter.name));
        Ok(())
    }

    fn activate_adapters(&mut self, adapters: &[LoraOption]) -> Result<()> {
        let names = adapters
            .iter()
            .map(|a| format!("{}={}", a.name, a.strength))
            .collect::<Vec<_>>();
        self.probe.event(format!("activate {}", names.join(",")));
        Ok(())
    }

    fn detach_adapters(&mut self) -> Result<()> {
        self.probe.event("detach");
        Ok(())
    }

    fn encode_prompt(&mut self, request: &PromptRequest) -> Result<PromptEmbeddings> {
        self.probe.encodes.fetch_add(1, Ordering::SeqCst);
        let t = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        let negative = if request.guidance { vec![t.clone()] } else { vec![] };
        Ok(PromptEmbeddings {
            positive: vec![t],
            negative,
        })
    }

    fn generate(
        &mut self,
        request: &GenerationRequest<'_>,
        callback: &mut dyn StepCallback,
    ) -> Result<GenerationOutput> {
        let opts = request.options;
        let (h, w) = (opts.height.max(8), opts.width.max(8));
        let latents = Tensor::zeros((1, 4, h / 8, w / 8), DType::F32, &Device::Cpu)?;
        let timesteps = request.sampler.timesteps(opts.steps, (h / 16) * (w / 16));
        let probe = self.probe.clone();
        let outcome = DenoiseLoop::new(&timesteps, true).run(
            &latents,
            |x, _, _| {
                let step = probe.steps.fetch_add(1, Ordering::SeqCst);
                if let Some(hook) = probe.step_hook.lock().unwrap().as_ref() {
                    hook(step);
                }
                x + 1.
            },
            callback,
        )?;
        if let DenoiseOutcome::Interrupted { step } = outcome {
            anyhow::bail!("interrupted at step {step}");
        }

        if let Some(path) = &opts.temp_filename {
            return Ok(GenerationOutput::Saved(path.clone()));
        }
        let frames = match request.process_type.capabilities().output {
            OutputKind::Image => Tensor::zeros((1, h, w, 3), DType::F32, &Device::Cpu)?,
            OutputKind::Video => {
                Tensor::zeros((1, opts.frames.max(1), h, w, 3), DType::BF16, &Device::Cpu)?
            }
        };
        self.probe.event(format!("generate {}", self.family));
        Ok(GenerationOutput::Frames(frames))
    }

    fn empty_cache(&mut self) -> Result<()> {
        self.probe.empty_cache.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeBuilder(pub Arc<Probe>);

impl RuntimeBuilder for FakeBuilder {
    fn assemble(
        &self,
        family: PipelineFamily,
        process_type: ProcessType,
        parts: &PipelineParts,
        _device: &Device,
        settings: RuntimeSettings,
    ) -> Result<Box<dyn PipelineRuntime>> {
        self.0.event(format!(
            "assemble {family} {process_type} {} parts {:?}",
            parts.components.len() + usize::from(parts.control_net.is_some()),
            settings.dtype
        ));
        Ok(Box::new(FakeRuntime {
            probe: self.0.clone(),
            family,
        }))
    }
}

pub fn engine_with(policy: QuantizationPolicy) -> (Engine, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let engine = Engine::with_policy(
        Arc::new(FakeFetcher(probe.clone())),
        Arc::new(FakeBuilder(probe.clone())),
        policy,
    );
    (engine, probe)
}

pub fn engine() -> (Engine, Arc<Probe>) {
    engine_with(QuantizationPolicy::new(Some(Arc::new(GgmlBackend))))
}

pub fn config(pipeline: &str, process_type: &str) -> Value {
    json!({
        "base_model_path": "org/model",
        "pipeline": pipeline,
        "process_type": process_type,
        "memory_mode": "Device",
        "device": "cpu",
        "data_type": "float32",
        "is_silent": true,
    })
}

pub fn options(prompt: &str, steps: usize) -> Value {
    json!({
        "prompt": prompt,
        "seed": 42,
        "steps": steps,
        "height": 64,
        "width": 64,
        "scheduler": "euler",
    })
}
