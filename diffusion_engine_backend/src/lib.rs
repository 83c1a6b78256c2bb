use std::{
    env,
    fmt::{Debug, Display},
    sync::Arc,
};

use candle_core::{
    quantized::{GgmlDType, QTensor},
    DType, Device, Module, Result, Tensor,
};
use diffusion_engine_common::Precision;
use once_cell::sync::Lazy;
use tracing::{info, warn};

mod fp8;
mod gguf;
mod int8;
mod policy;
mod unquantized;

pub use fp8::Fp8Linear;
pub use gguf::GgufMatMul;
pub use int8::Int8Linear;
pub use policy::{QuantDecision, QuantReport, QuantizationPolicy, UnsupportedReason};
pub use unquantized::UnquantLinear;

/// Environment variable selecting the process-wide quantization backend (`ggml` or `none`).
pub const QUANT_BACKEND_ENV: &str = "DIFFUSION_ENGINE_QUANT_BACKEND";

#[derive(Debug, Clone)]
pub enum QuantMethodConfig {
    Unquantized {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    Int8 {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    Fp8 {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    Gguf {
        q_weight: Arc<QTensor>,
        b: Option<Tensor>,
    },
}

/// Weight-only compression applied to an already-loaded layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuantStrategy {
    Int8WeightOnly,
    Float8WeightOnly,
}

impl QuantStrategy {
    pub fn precision(&self) -> Precision {
        match self {
            Self::Int8WeightOnly => Precision::Int8,
            Self::Float8WeightOnly => Precision::F8E4M3,
        }
    }
}

impl Display for QuantStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int8WeightOnly => write!(f, "int8 weight-only"),
            Self::Float8WeightOnly => write!(f, "float8 weight-only"),
        }
    }
}

/// Declarative quantization request handed to a model fetcher at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantizationConfig {
    pub backend: &'static str,
    pub strategy: QuantStrategy,
    /// Precision of the layers left unquantized (norms, embeddings).
    pub compute: Precision,
}

/// Quantized method for a quantized matmul.
pub trait QuantMethod: Send + Sync + Debug {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized;

    fn dequantize_w(&self, out_ty: DType) -> Result<Tensor>;

    /// Compute matmul of `self` and `a`. `self` should contain the weights.
    /// Automatically cast to required quantization actiation type and back
    fn forward_autocast(&self, a: &Tensor) -> Result<Tensor> {
        let original_ty = a.dtype();
        let a = if let Some(t) = self.quantized_act_type() {
            a.to_dtype(t)?
        } else {
            a.clone()
        };
        self.forward(&a)?.to_dtype(original_ty)
    }

    /// Compute matmul of `self` and `a`. `self` should contain the weights.
    fn forward(&self, a: &Tensor) -> Result<Tensor>;

    /// If a quantized method, return the activation dtype.
    fn quantized_act_type(&self) -> Option<DType>;

    fn to_device(&self, dev: &Device) -> Result<Arc<dyn QuantMethod>>;

    fn size_in_bytes(&self) -> Result<usize>;

    fn device(&self) -> Device;

    /// Storage precision of the weights.
    fn precision(&self) -> Precision;

    fn bias(&self) -> Option<&Tensor>;

    /// Pre-quantized GGUF weights are never compressed again.
    fn is_gguf(&self) -> bool {
        false
    }
}

impl Module for dyn QuantMethod {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        QuantMethod::forward(self, xs)
    }
}

/// Re-encode `layer` with `strategy`, keeping its bias.
pub fn quantize_layer(
    layer: &Arc<dyn QuantMethod>,
    strategy: QuantStrategy,
) -> Result<Arc<dyn QuantMethod>> {
    if layer.is_gguf() {
        candle_core::bail!("GGUF layers are already quantized");
    }
    let weight = layer.dequantize_w(DType::F32)?;
    let bias = layer.bias().cloned();
    let layer: Arc<dyn QuantMethod> = match strategy {
        QuantStrategy::Int8WeightOnly => {
            Arc::new(Int8Linear::new(QuantMethodConfig::Int8 { weight, bias })?)
        }
        QuantStrategy::Float8WeightOnly => {
            Arc::new(Fp8Linear::new(QuantMethodConfig::Fp8 { weight, bias })?)
        }
    };
    Ok(layer)
}

pub fn unquantized_layer(weight: Tensor, bias: Option<Tensor>) -> Result<Arc<dyn QuantMethod>> {
    let layer = UnquantLinear::new(QuantMethodConfig::Unquantized { weight, bias })?;
    Ok(Arc::new(layer))
}

#[derive(Debug)]
pub struct QuantizedModelLayer<'a>(pub Vec<&'a mut Arc<dyn QuantMethod>>);

pub trait QuantizedModel {
    /// Ensure that the devices of each layer match.
    fn match_devices_all_layers(&mut self, dev: &Device) -> Result<()>;
    /// Return all linear layers.
    fn aggregate_layers(&mut self) -> Result<Vec<QuantizedModelLayer>>;
    /// Cast all linear layers to the given device.
    fn to_device(&mut self, dev: &Device) -> Result<()> {
        let layers = self.aggregate_layers()?;
        for layer in layers {
            for x in layer.0 {
                *x = x.to_device(dev)?;
            }
        }
        self.match_devices_all_layers(dev)?;
        Ok(())
    }
    fn total_size_in_bytes(&mut self) -> Result<usize> {
        let layers = self.aggregate_layers()?;
        let mut total = 0;

        for layer in layers {
            for x in &layer.0 {
                total += x.size_in_bytes()?;
            }
        }

        Ok(total)
    }
    /// Compress every linear layer in place. GGUF layers are skipped and a layer
    /// that cannot be encoded keeps its original weights.
    fn quantize_layers(&mut self, strategy: QuantStrategy) -> Result<QuantReport> {
        let mut report = QuantReport::default();
        let layers = self.aggregate_layers()?;
        for layer in layers {
            for x in layer.0 {
                if x.is_gguf() {
                    report.skipped += 1;
                    continue;
                }
                let before = x.size_in_bytes()?;
                match quantize_layer(x, strategy) {
                    Ok(q) => {
                        report.bytes_before += before;
                        report.bytes_after += q.size_in_bytes()?;
                        report.quantized += 1;
                        *x = q;
                    }
                    Err(e) => {
                        tracing::debug!("[Quantize] keeping layer unquantized: {e}");
                        report.skipped += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

/// A weight compression engine available to this process.
pub trait QuantBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Strategy used to reach `requested`, or `None` if this backend cannot produce it.
    fn strategy_for(&self, requested: Precision) -> Option<QuantStrategy>;
}

/// Candle's GGML block quantization for int8 plus float8 weight storage.
#[derive(Debug, Default)]
pub struct GgmlBackend;

impl QuantBackend for GgmlBackend {
    fn name(&self) -> &'static str {
        "ggml"
    }

    fn strategy_for(&self, requested: Precision) -> Option<QuantStrategy> {
        match requested {
            Precision::Int8 => Some(QuantStrategy::Int8WeightOnly),
            Precision::F8E4M3 => Some(QuantStrategy::Float8WeightOnly),
            _ => None,
        }
    }
}

impl GgmlBackend {
    /// The GGML kernels are compiled into every build; checks that Q8_0 encoding works here.
    fn probe() -> Result<()> {
        let t = Tensor::zeros((1, GgmlDType::Q8_0.block_size()), DType::F32, &Device::Cpu)?;
        QTensor::quantize(&t, GgmlDType::Q8_0).map(|_| ())
    }
}

static ACTIVE_BACKEND: Lazy<Option<Arc<dyn QuantBackend>>> = Lazy::new(|| {
    let requested = env::var(QUANT_BACKEND_ENV).ok();
    let backend = select_backend(requested.as_deref());
    match &backend {
        Some(b) => info!("[Quantize] Backend: {}", b.name()),
        None => info!("[Quantize] Backend: none"),
    }
    backend
});

fn select_backend(requested: Option<&str>) -> Option<Arc<dyn QuantBackend>> {
    match requested.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("none") | Some("off") => None,
        Some("ggml") | Some("") | None => match GgmlBackend::probe() {
            Ok(()) => Some(Arc::new(GgmlBackend)),
            Err(e) => {
                warn!("[Quantize] ggml backend unavailable: {e}");
                None
            }
        },
        Some(other) => {
            warn!("[Quantize] Unknown backend `{other}`, quantization disabled");
            None
        }
    }
}

/// The process-wide backend, probed once on first use.
pub fn active_backend() -> Option<Arc<dyn QuantBackend>> {
    ACTIVE_BACKEND.clone()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, Result, Tensor};
    use diffusion_engine_common::Precision;

    use super::{
        select_backend, unquantized_layer, QuantMethod, QuantStrategy, QuantizedModel,
        QuantizedModelLayer,
    };

    struct TwoLayers {
        layers: Vec<Arc<dyn QuantMethod>>,
    }

    impl QuantizedModel for TwoLayers {
        fn match_devices_all_layers(&mut self, _dev: &Device) -> Result<()> {
            Ok(())
        }
        fn aggregate_layers(&mut self) -> Result<Vec<QuantizedModelLayer>> {
            Ok(vec![QuantizedModelLayer(self.layers.iter_mut().collect())])
        }
    }

    #[test]
    fn backend_selection_by_name() {
        assert_eq!(select_backend(Some("ggml")).unwrap().name(), "ggml");
        assert_eq!(select_backend(None).unwrap().name(), "ggml");
        assert!(select_backend(Some("none")).is_none());
        assert!(select_backend(Some("bitsandbytes")).is_none());
    }

    #[test]
    fn ggml_strategies() {
        let b = select_backend(Some("ggml")).unwrap();
        assert_eq!(b.strategy_for(Precision::Int8), Some(QuantStrategy::Int8WeightOnly));
        assert_eq!(
            b.strategy_for(Precision::F8E4M3),
            Some(QuantStrategy::Float8WeightOnly)
        );
        assert_eq!(b.strategy_for(Precision::F8E5M2), None);
        assert_eq!(b.strategy_for(Precision::F16), None);
    }

    #[test]
    fn quantize_layers_in_place() -> Result<()> {
        let dev = Device::Cpu;
        let good = Tensor::ones((8, 64), DType::F32, &dev)?;
        // 33 input features is not a multiple of the Q8_0 block.
        let odd = Tensor::ones((8, 33), DType::F32, &dev)?;
        let mut model = TwoLayers {
            layers: vec![unquantized_layer(good, None)?, unquantized_layer(odd, None)?],
        };
        let before = model.total_size_in_bytes()?;

        let report = model.quantize_layers(QuantStrategy::Int8WeightOnly)?;
        assert_eq!(report.quantized, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(model.layers[0].precision(), Precision::Int8);
        assert_eq!(model.layers[1].precision(), Precision::F32);
        assert!(model.total_size_in_bytes()? < before);
        Ok(())
    }

    #[test]
    fn float8_layers_keep_outputs_close() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::arange(0f32, 32., &dev)?.reshape((4, 8))?.affine(0.1, -1.)?;
        let x = Tensor::ones((2, 8), DType::F32, &dev)?;
        let mut model = TwoLayers {
            layers: vec![unquantized_layer(w, None)?],
        };
        let expected = model.layers[0].forward(&x)?;
        model.quantize_layers(QuantStrategy::Float8WeightOnly)?;
        assert_eq!(model.layers[0].precision(), Precision::F8E4M3);
        let got = model.layers[0].forward(&x)?;
        let err = (expected - got)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 0.5, "max abs error {err}");
        Ok(())
    }
}
