//! Lifecycle and generation orchestration for diffusion pipelines.
//!
//! The [`Engine`] owns at most one assembled pipeline. Model implementations plug in through two
//! seams: a [`ModelFetcher`] that loads sub-models and a [`RuntimeBuilder`] that turns them into a
//! [`PipelineRuntime`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use diffusion_engine_core::{Engine, ModelFetcher, RuntimeBuilder};
//! use serde_json::json;
//!
//! # fn run(fetcher: Arc<dyn ModelFetcher>, builder: Arc<dyn RuntimeBuilder>) -> anyhow::Result<()> {
//! let engine = Engine::new(fetcher, builder);
//! engine.init_logging();
//!
//! engine.configure(&json!({
//!     "base_model_path": "black-forest-labs/FLUX.1-dev",
//!     "pipeline": "Flux",
//!     "process_type": "TextToImage",
//!     "memory_mode": "OffloadModel",
//!     "data_type": "bfloat16",
//!     "quant_data_type": "int8",
//! }))?;
//!
//! let images = engine.generate(
//!     &json!({
//!         "prompt": "Draw a picture of a sunrise.",
//!         "seed": 42,
//!         "steps": 30,
//!         "height": 720,
//!         "width": 1280,
//!         "guidance_scale": 3.5,
//!         "scheduler": "FlowMatchEulerDiscrete",
//!     }),
//!     None,
//!     None,
//! )?;
//! println!("{:?}", images[0].shape);
//!
//! for line in engine.poll_logs() {
//!     println!("{line}");
//! }
//! engine.release()?;
//! # Ok(())
//! # }
//! ```

mod adapters;
mod buffers;
mod config;
mod engine;
mod error;
mod family;
mod loader;
mod memory;
mod pipeline;
mod prompt_cache;
mod runtime;
mod sampling;
mod scheduler;
mod util;

pub use adapters::AdapterState;
pub use buffers::{decode_image, prepare_images, FlatTensor, ImageInput, SampleBuffer};
pub use config::{
    CheckpointConfig, ControlNetConfig, LoraAdapter, LoraOption, PipelineConfig, PipelineOptions,
};
pub use engine::{CancelHandle, Engine};
pub use error::{EngineError, ErrorKind, Result};
pub use family::{
    ComponentName, ComponentRole, FamilyDescriptor, OutputKind, PipelineFamily,
    ProcessCapabilities, ProcessType, PromptCachePolicy,
};
pub use loader::{
    FetchRequest, HubFetcher, LoadQuantization, ModelFactory, ModelFetcher, ModelLoader,
    SharedModel, SubModel,
};
pub use memory::{reclaim_memory, MemoryPlacement, OffloadStrategy};
pub use pipeline::{PipelineAssembler, PipelineHandle, PipelineParts};
pub use prompt_cache::PromptCache;
pub use runtime::{
    GenerationOutput, GenerationRequest, PipelineRuntime, PromptEmbeddings, PromptRequest,
    RuntimeBuilder, RuntimeSettings,
};
pub use sampling::{DenoiseLoop, DenoiseOutcome, StepCallback, StepControl, StepState};
pub use scheduler::{
    AlgorithmType, BetaSchedule, PredictionType, Sampler, SamplerKind, SchedulerOptions,
    SolverType, TimestepSpacing, VarianceType,
};
pub use util::{resolve_precision, DeviceKind};

pub use diffusion_engine_backend::{QuantBackend, QuantizationPolicy, QuantizedModel};
pub use diffusion_engine_common::{
    core, MemoryMode, ModelSource, Precision, ProgressEvent, ProgressSink, ProgressTracker,
    TokenSource,
};
