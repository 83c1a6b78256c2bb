use tracing::info;

use crate::{
    config::{LoraAdapter, LoraOption},
    error::{EngineError, Result},
    runtime::PipelineRuntime,
};

/// Adapters attached to one pipeline and which of them are currently active.
#[derive(Clone, Debug, Default)]
pub struct AdapterState {
    attached: Vec<LoraAdapter>,
    active: Vec<LoraOption>,
}

impl AdapterState {
    pub fn attached(&self) -> &[LoraAdapter] {
        &self.attached
    }

    pub fn active(&self) -> &[LoraOption] {
        &self.active
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.attached.iter().any(|a| a.name == name)
    }

    /// Attach every adapter in order. Stops at the first failure, keeping those already attached.
    pub fn attach_all(
        &mut self,
        runtime: &mut dyn PipelineRuntime,
        adapters: &[LoraAdapter],
    ) -> anyhow::Result<()> {
        for adapter in adapters {
            info!("[Load] Loading LoRA adapter {}", adapter.name);
            runtime.attach_adapter(adapter)?;
            self.attached.push(adapter.clone());
        }
        Ok(())
    }

    /// Activate `options`, a subset of the attached adapters, at their strengths.
    ///
    /// An unchanged selection is not re-sent to the runtime.
    pub fn activate(
        &mut self,
        runtime: &mut dyn PipelineRuntime,
        options: &[LoraOption],
    ) -> Result<()> {
        if let Some(unknown) = options.iter().find(|o| !self.is_attached(&o.name)) {
            return Err(EngineError::UnknownAdapter(unknown.name.clone()));
        }
        if options == self.active.as_slice() {
            return Ok(());
        }
        runtime
            .activate_adapters(options)
            .map_err(EngineError::Generation)?;
        self.active = options.to_vec();
        Ok(())
    }

    /// Remove every adapter from the runtime, returning what was attached.
    pub fn detach(
        &mut self,
        runtime: &mut dyn PipelineRuntime,
    ) -> anyhow::Result<Vec<LoraAdapter>> {
        if !self.attached.is_empty() {
            runtime.detach_adapters()?;
        }
        self.active.clear();
        Ok(std::mem::take(&mut self.attached))
    }
}
