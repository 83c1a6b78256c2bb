use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use candle_core::Result;
use diffusion_engine_common::{MemoryMode, Precision};
use tracing::info;

use crate::{active_backend, QuantBackend, QuantStrategy, QuantizationConfig, QuantizedModel};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsupportedReason {
    NoBackend,
    CpuOffload,
    SamePrecision,
    UnsupportedPrecision,
}

impl Display for UnsupportedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBackend => write!(f, "No quantization backend found."),
            Self::CpuOffload => write!(f, "OffloadCPU does not support quantization."),
            Self::SamePrecision => write!(f, "Model is already at the requested precision."),
            Self::UnsupportedPrecision => {
                write!(f, "Backend cannot produce the requested precision.")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantDecision {
    Unsupported(UnsupportedReason),
    Supported {
        backend: &'static str,
        strategy: QuantStrategy,
    },
}

impl QuantDecision {
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported { .. })
    }

    pub fn strategy(&self) -> Option<QuantStrategy> {
        match self {
            Self::Supported { strategy, .. } => Some(*strategy),
            Self::Unsupported(_) => None,
        }
    }
}

/// Outcome of quantizing one sub-model in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantReport {
    pub quantized: usize,
    pub skipped: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Decides whether a sub-model is compressed, and how.
#[derive(Debug, Clone)]
pub struct QuantizationPolicy {
    backend: Option<Arc<dyn QuantBackend>>,
}

impl QuantizationPolicy {
    pub fn new(backend: Option<Arc<dyn QuantBackend>>) -> Self {
        Self { backend }
    }

    /// Policy over the process-wide backend.
    pub fn probe() -> Self {
        Self::new(active_backend())
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Rules, first match wins: no backend, full CPU offload, same precision,
    /// then whatever the backend can produce for `requested`.
    pub fn decide(&self, native: Precision, requested: Precision, mode: MemoryMode) -> QuantDecision {
        let Some(backend) = &self.backend else {
            return QuantDecision::Unsupported(UnsupportedReason::NoBackend);
        };
        if mode == MemoryMode::OffloadCPU {
            return QuantDecision::Unsupported(UnsupportedReason::CpuOffload);
        }
        if native == requested {
            return QuantDecision::Unsupported(UnsupportedReason::SamePrecision);
        }
        match backend.strategy_for(requested) {
            Some(strategy) => QuantDecision::Supported {
                backend: backend.name(),
                strategy,
            },
            None => QuantDecision::Unsupported(UnsupportedReason::UnsupportedPrecision),
        }
    }

    fn decide_logged(&self, native: Precision, requested: Precision, mode: MemoryMode) -> QuantDecision {
        let decision = self.decide(native, requested, mode);
        match decision {
            QuantDecision::Unsupported(UnsupportedReason::SamePrecision) => {
                info!("[Quantize] Model is already '{requested}' skipping quantization.")
            }
            QuantDecision::Unsupported(reason) => info!("[Quantize] {reason}"),
            QuantDecision::Supported { .. } => {
                info!("[Quantize] Quantizing model from '{native}' to '{requested}'")
            }
        }
        decision
    }

    /// Declarative config for the load-time path, `None` when nothing applies.
    pub fn model_config(
        &self,
        native: Precision,
        requested: Precision,
        mode: MemoryMode,
    ) -> Option<QuantizationConfig> {
        match self.decide_logged(native, requested, mode) {
            QuantDecision::Supported { backend, strategy } => Some(QuantizationConfig {
                backend,
                strategy,
                compute: native,
            }),
            QuantDecision::Unsupported(_) => None,
        }
    }

    /// One declarative config per named component, `None` when nothing applies.
    pub fn pipeline_config(
        &self,
        native: Precision,
        requested: Precision,
        mode: MemoryMode,
        components: &[&str],
    ) -> Option<BTreeMap<String, QuantizationConfig>> {
        let config = self.model_config(native, requested, mode)?;
        let mapping = components
            .iter()
            .map(|c| (c.to_string(), config))
            .collect::<BTreeMap<_, _>>();
        (!mapping.is_empty()).then_some(mapping)
    }

    /// Compress an already-loaded sub-model in place. Returns `None` when the
    /// policy declines and the model is left untouched.
    pub fn quantize_model<M: QuantizedModel + ?Sized>(
        &self,
        model: &mut M,
        native: Precision,
        requested: Precision,
        mode: MemoryMode,
    ) -> Result<Option<QuantReport>> {
        let Some(strategy) = self.decide_logged(native, requested, mode).strategy() else {
            return Ok(None);
        };
        let report = model.quantize_layers(strategy)?;
        info!(
            "[Quantize] {strategy}: {} layers quantized, {} skipped, {} -> {} bytes",
            report.quantized, report.skipped, report.bytes_before, report.bytes_after
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, Result, Tensor};
    use diffusion_engine_common::{MemoryMode, Precision};

    use super::{QuantDecision, QuantizationPolicy, UnsupportedReason};
    use crate::{
        unquantized_layer, GgmlBackend, QuantMethod, QuantStrategy, QuantizedModel,
        QuantizedModelLayer,
    };

    fn ggml() -> QuantizationPolicy {
        QuantizationPolicy::new(Some(Arc::new(GgmlBackend)))
    }

    struct OneLayer(Vec<Arc<dyn QuantMethod>>);

    impl QuantizedModel for OneLayer {
        fn match_devices_all_layers(&mut self, _dev: &Device) -> Result<()> {
            Ok(())
        }
        fn aggregate_layers(&mut self) -> Result<Vec<QuantizedModelLayer>> {
            Ok(vec![QuantizedModelLayer(self.0.iter_mut().collect())])
        }
    }

    #[test]
    fn no_backend_wins_over_everything() {
        let p = QuantizationPolicy::new(None);
        assert_eq!(
            p.decide(Precision::BF16, Precision::Int8, MemoryMode::OffloadCPU),
            QuantDecision::Unsupported(UnsupportedReason::NoBackend)
        );
    }

    #[test]
    fn offload_cpu_is_never_quantized() {
        for requested in [Precision::Int8, Precision::F8E4M3, Precision::F16] {
            assert_eq!(
                ggml().decide(Precision::BF16, requested, MemoryMode::OffloadCPU),
                QuantDecision::Unsupported(UnsupportedReason::CpuOffload)
            );
        }
    }

    #[test]
    fn same_precision_is_a_no_op() {
        assert_eq!(
            ggml().decide(Precision::BF16, Precision::BF16, MemoryMode::Device),
            QuantDecision::Unsupported(UnsupportedReason::SamePrecision)
        );
        assert!(ggml()
            .model_config(Precision::F16, Precision::F16, MemoryMode::OffloadModel)
            .is_none());
    }

    #[test]
    fn supported_precisions_pick_a_strategy() {
        let d = ggml().decide(Precision::BF16, Precision::Int8, MemoryMode::Device);
        assert_eq!(
            d,
            QuantDecision::Supported {
                backend: "ggml",
                strategy: QuantStrategy::Int8WeightOnly
            }
        );
        let d = ggml().decide(Precision::BF16, Precision::F8E4M3, MemoryMode::LowMemDevice);
        assert_eq!(d.strategy(), Some(QuantStrategy::Float8WeightOnly));
        let d = ggml().decide(Precision::BF16, Precision::F8E5M2, MemoryMode::Device);
        assert_eq!(
            d,
            QuantDecision::Unsupported(UnsupportedReason::UnsupportedPrecision)
        );
    }

    #[test]
    fn pipeline_config_maps_every_component() {
        let cfg = ggml()
            .pipeline_config(
                Precision::BF16,
                Precision::Int8,
                MemoryMode::Device,
                &["transformer", "text_encoder"],
            )
            .unwrap();
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg["transformer"].compute, Precision::BF16);
    }

    #[test]
    fn declined_policy_leaves_model_untouched() -> Result<()> {
        let w = Tensor::ones((4, 32), DType::F32, &Device::Cpu)?;
        let mut model = OneLayer(vec![unquantized_layer(w, None)?]);
        let before = model.0[0].clone();
        let report =
            ggml().quantize_model(&mut model, Precision::F32, Precision::F32, MemoryMode::Device)?;
        assert!(report.is_none());
        assert!(Arc::ptr_eq(&before, &model.0[0]));

        let report =
            ggml().quantize_model(&mut model, Precision::F32, Precision::Int8, MemoryMode::Device)?;
        assert_eq!(report.map(|r| r.quantized), Some(1));
        assert_eq!(model.0[0].precision(), Precision::Int8);
        Ok(())
    }
}
