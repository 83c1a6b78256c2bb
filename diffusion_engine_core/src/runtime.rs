//! Seam between the orchestrator and the model implementations.
//!
//! A [`PipelineRuntime`] owns the numerical side of one assembled pipeline: prompt encoding, the
//! denoising loop, and decoding. The engine only ever talks to it through this trait.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use diffusion_engine_common::Precision;

use crate::{
    buffers::ImageInput,
    config::{LoraAdapter, LoraOption, PipelineOptions},
    family::{PipelineFamily, ProcessType},
    memory::MemoryPlacement,
    pipeline::PipelineParts,
    sampling::StepCallback,
    scheduler::Sampler,
};

/// The exact inputs prompt encoding depends on.
#[derive(Clone, Debug, PartialEq)]
pub struct PromptRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance: bool,
}

#[derive(Clone, Debug)]
pub struct PromptEmbeddings {
    pub positive: Vec<Tensor>,
    pub negative: Vec<Tensor>,
}

/// Everything a runtime needs for one generation call.
pub struct GenerationRequest<'a> {
    pub options: &'a PipelineOptions,
    pub process_type: ProcessType,
    pub sampler: &'a Sampler,
    pub embeddings: &'a PromptEmbeddings,
    pub images: Option<&'a ImageInput>,
    pub control_images: Option<&'a ImageInput>,
}

#[derive(Debug)]
pub enum GenerationOutput {
    /// Channels-last frames: `(b, h, w, c)` for images, `(b, f, h, w, c)` for video.
    Frames(Tensor),
    /// The runtime encoded its output to this file itself.
    Saved(PathBuf),
}

pub trait PipelineRuntime: Send {
    /// Sampler the pipeline ships with; per-call options are laid over it.
    fn default_sampler(&self) -> Sampler;

    fn configure_memory(&mut self, placement: &MemoryPlacement, device: &Device)
        -> anyhow::Result<()>;

    /// Bake one adapter's weights into the pipeline.
    fn attach_adapter(&mut self, adapter: &LoraAdapter) -> anyhow::Result<()>;

    /// Set the active adapter subset and strengths. Names are already validated.
    fn activate_adapters(&mut self, adapters: &[LoraOption]) -> anyhow::Result<()>;

    /// Remove every attached adapter.
    fn detach_adapters(&mut self) -> anyhow::Result<()>;

    fn encode_prompt(&mut self, request: &PromptRequest) -> anyhow::Result<PromptEmbeddings>;

    fn generate(
        &mut self,
        request: &GenerationRequest<'_>,
        callback: &mut dyn StepCallback,
    ) -> anyhow::Result<GenerationOutput>;

    fn empty_cache(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Resolved numeric settings for a pipeline being assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub precision: Precision,
    pub dtype: DType,
}

/// Builds the runtime for a family once its sub-models are loaded.
pub trait RuntimeBuilder: Send + Sync {
    fn assemble(
        &self,
        family: PipelineFamily,
        process_type: ProcessType,
        parts: &PipelineParts,
        device: &Device,
        settings: RuntimeSettings,
    ) -> anyhow::Result<Box<dyn PipelineRuntime>>;
}
