use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use candle_core::{DType, Tensor};
use diffusion_engine_backend::QuantizationPolicy;
use diffusion_engine_common::{LogBuffer, ProgressBarSink, ProgressSink, ProgressTracker};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    buffers::{prepare_images, FlatTensor, SampleBuffer},
    config::{PipelineConfig, PipelineOptions},
    error::{EngineError, Result},
    family::OutputKind,
    loader::ModelFetcher,
    memory::reclaim_memory,
    pipeline::{PipelineAssembler, PipelineHandle},
    runtime::{GenerationOutput, GenerationRequest, RuntimeBuilder},
    sampling::{StepControl, StepState},
    scheduler::Sampler,
};

/// Sets the cancellation flag of an [`Engine`] from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct EngineState {
    handle: Option<PipelineHandle>,
    sinks: Vec<Arc<dyn ProgressSink>>,
}

/// The single-instance orchestrator behind the caller-facing operations.
///
/// Holds at most one live pipeline. Every operation blocks; only [`Engine::cancel`] (or a
/// [`CancelHandle`]) may be used while a [`Engine::generate`] call is in flight.
pub struct Engine {
    fetcher: Arc<dyn ModelFetcher>,
    builder: Arc<dyn RuntimeBuilder>,
    policy: QuantizationPolicy,
    state: Mutex<EngineState>,
    cancel: Arc<AtomicBool>,
    last_latent: Mutex<Option<SampleBuffer>>,
    logs: LogBuffer,
}

impl Engine {
    /// Engine over the process-wide quantization backend.
    pub fn new(fetcher: Arc<dyn ModelFetcher>, builder: Arc<dyn RuntimeBuilder>) -> Self {
        Self::with_policy(fetcher, builder, QuantizationPolicy::probe())
    }

    pub fn with_policy(
        fetcher: Arc<dyn ModelFetcher>,
        builder: Arc<dyn RuntimeBuilder>,
        policy: QuantizationPolicy,
    ) -> Self {
        Self {
            fetcher,
            builder,
            policy,
            state: Mutex::new(EngineState {
                handle: None,
                sinks: Vec::new(),
            }),
            cancel: Arc::new(AtomicBool::new(false)),
            last_latent: Mutex::new(None),
            logs: LogBuffer::new(),
        }
    }

    /// Route `tracing` output into this engine's log buffer. `false` if a subscriber already exists.
    pub fn init_logging(&self) -> bool {
        diffusion_engine_common::init_logging(&self.logs)
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.logs
    }

    /// Receive load progress for every subsequent configure or rebuild.
    pub fn add_progress_sink(&self, sink: Arc<dyn ProgressSink>) -> Result<()> {
        self.state()?.sinks.push(sink);
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Generation(anyhow::anyhow!("engine state lock poisoned")))
    }

    fn assembler(&self) -> PipelineAssembler<'_> {
        PipelineAssembler {
            fetcher: self.fetcher.as_ref(),
            builder: self.builder.as_ref(),
            policy: &self.policy,
        }
    }

    fn tracker(sinks: &[Arc<dyn ProgressSink>], silent: bool) -> ProgressTracker {
        let mut tracker = ProgressTracker::new(0);
        for sink in sinks {
            tracker.add_sink(sink.clone());
        }
        if !silent {
            tracker.add_sink(Arc::new(ProgressBarSink::new()));
        }
        tracker
    }

    fn set_last_latent(&self, latent: Option<SampleBuffer>) {
        *self
            .last_latent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = latent;
    }

    /// Build a fresh pipeline, releasing the current one first.
    ///
    /// On failure no pipeline is loaded.
    pub fn configure(&self, payload: &Value) -> Result<()> {
        let mut state = self.state()?;
        if let Some(previous) = state.handle.take() {
            Self::teardown(previous);
        }
        self.set_last_latent(None);

        let config = PipelineConfig::from_value(payload)?;
        let mut tracker = Self::tracker(&state.sinks, config.is_silent);
        let handle = self.assembler().build(config, &mut tracker)?;
        state.handle = Some(handle);
        Ok(())
    }

    /// Reload the current pipeline, reusing every sub-model it already holds.
    ///
    /// On failure the current pipeline stays loaded.
    pub fn rebuild(&self, payload: &Value) -> Result<()> {
        let mut state = self.state()?;
        let config = PipelineConfig::from_value(payload)?;
        let mut tracker = Self::tracker(&state.sinks, config.is_silent);
        let Some(existing) = state.handle.as_mut() else {
            return Err(EngineError::NoPipelineLoaded);
        };
        let rebuilt = self.assembler().rebuild(config, existing, &mut tracker)?;
        let offload = rebuilt.placement.is_offload();
        drop(std::mem::replace(existing, rebuilt));
        self.set_last_latent(None);
        reclaim_memory(None, offload);
        Ok(())
    }

    /// Run one generation on the loaded pipeline.
    ///
    /// Memory is reclaimed afterwards whether or not the call succeeds. A cancellation observed
    /// at a step boundary returns [`EngineError::OperationCanceled`] and no output.
    pub fn generate(
        &self,
        payload: &Value,
        images: Option<&[FlatTensor]>,
        control_images: Option<&[FlatTensor]>,
    ) -> Result<Vec<SampleBuffer>> {
        let mut state = self.state()?;
        // Cleared under the lock so a cancel aimed at an in-flight call is not lost.
        self.cancel.store(false, Ordering::SeqCst);
        let Some(handle) = state.handle.as_mut() else {
            return Err(EngineError::NoPipelineLoaded);
        };

        let result = self.run(handle, payload, images, control_images);
        reclaim_memory(Some(handle.runtime.as_mut()), handle.placement.is_offload());
        match &result {
            Err(EngineError::OperationCanceled) => info!("[Generate] Operation Canceled"),
            Err(e) => warn!("[Generate] {} {e}", e.kind()),
            Ok(_) => info!("[Generate] Complete"),
        }
        result
    }

    fn run(
        &self,
        handle: &mut PipelineHandle,
        payload: &Value,
        images: Option<&[FlatTensor]>,
        control_images: Option<&[FlatTensor]>,
    ) -> Result<Vec<SampleBuffer>> {
        let options = PipelineOptions::from_value(payload)?;
        let process_type = handle.config.process_type;
        let caps = process_type.capabilities();

        handle.sampler = Sampler::from_request(
            &options.scheduler,
            &options.scheduler_options,
            &handle.sampler,
        )?;
        info!(
            "[Generate] {process_type}: {} steps, scheduler {}",
            options.steps,
            handle.sampler.kind()
        );

        handle
            .adapters
            .activate(handle.runtime.as_mut(), &options.lora_options)?;

        let images = if caps.image_input {
            prepare_images(images, &handle.device)?
        } else {
            if images.is_some_and(|i| !i.is_empty()) {
                debug!("[Generate] {process_type} takes no input image, ignoring it");
            }
            None
        };
        let control_images = if caps.control_images {
            prepare_images(control_images, &handle.device)?
        } else {
            None
        };

        let runtime = &mut handle.runtime;
        let embeddings = handle
            .prompt_cache
            .get_or_encode(&options, |request| runtime.encode_prompt(request))
            .map_err(EngineError::Generation)?;

        let cancel = self.cancel.clone();
        let mut interrupted_at = None;
        let mut callback = |state: &StepState<'_>| {
            if cancel.load(Ordering::SeqCst) {
                interrupted_at = Some(state.step);
                return StepControl::Interrupt;
            }
            if let Some(latents) = state.latents {
                match SampleBuffer::from_tensor(latents) {
                    Ok(buffer) => self.set_last_latent(Some(buffer)),
                    Err(e) => debug!("[Generate] Could not capture step latent: {e}"),
                }
            }
            StepControl::Continue
        };

        let request = GenerationRequest {
            options: &options,
            process_type,
            sampler: &handle.sampler,
            embeddings: &embeddings,
            images: images.as_ref(),
            control_images: control_images.as_ref(),
        };
        let output = handle.runtime.generate(&request, &mut callback);
        if let Some(step) = interrupted_at {
            debug!("[Generate] Interrupted after step {step}");
            return Err(EngineError::OperationCanceled);
        }

        match output.map_err(EngineError::Generation)? {
            GenerationOutput::Saved(path) => {
                info!("[Generate] Output written to {}", path.display());
                Ok(Vec::new())
            }
            GenerationOutput::Frames(frames) => {
                let frames = to_channels_first(frames, caps.output)?;
                Ok(vec![SampleBuffer::from_tensor(&frames)?])
            }
        }
    }

    /// Request cancellation of the in-flight generation, if any.
    pub fn cancel(&self) {
        info!("[Generate] Cancel requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Drop the loaded pipeline and reclaim its memory. A no-op when nothing is loaded.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state()?;
        if let Some(handle) = state.handle.take() {
            Self::teardown(handle);
            info!("[Load] Pipeline released");
        }
        self.set_last_latent(None);
        Ok(())
    }

    fn teardown(mut handle: PipelineHandle) {
        if let Err(e) = handle.adapters.detach(handle.runtime.as_mut()) {
            warn!("[Load] Could not detach adapters: {e}");
        }
        handle.prompt_cache.invalidate();
        let offload = handle.placement.is_offload();
        reclaim_memory(Some(handle.runtime.as_mut()), false);
        drop(handle);
        reclaim_memory(None, offload);
    }

    /// Drain buffered diagnostic lines, oldest first.
    pub fn poll_logs(&self) -> Vec<String> {
        self.logs.drain()
    }

    /// Latent captured at the last completed denoising step.
    pub fn peek_last_latent(&self) -> Option<SampleBuffer> {
        self.last_latent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_ok_and(|s| s.handle.is_some())
    }

    /// Run `f` against the loaded pipeline.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&PipelineHandle) -> R) -> Result<R> {
        let state = self.state()?;
        state
            .handle
            .as_ref()
            .map(f)
            .ok_or(EngineError::NoPipelineLoaded)
    }
}

/// `(b, h, w, c)` to `(b, c, h, w)`; `(b, f, h, w, c)` to `(b, f, c, h, w)`, batch dropped when 1.
fn to_channels_first(frames: Tensor, output: OutputKind) -> Result<Tensor> {
    let frames = match (output, frames.rank()) {
        (OutputKind::Image, 4) => frames.permute((0, 3, 1, 2))?,
        (OutputKind::Video, 5) => {
            let frames = frames.permute((0, 1, 4, 2, 3))?;
            if frames.dim(0)? == 1 {
                frames.squeeze(0)?
            } else {
                frames
            }
        }
        (output, rank) => {
            return Err(EngineError::Generation(anyhow::anyhow!(
                "runtime returned a rank {rank} tensor for {output:?} output"
            )))
        }
    };
    Ok(frames.to_dtype(DType::F32)?.contiguous()?)
}
