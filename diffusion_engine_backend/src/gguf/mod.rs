use std::sync::Arc;

use candle_core::{
    bail,
    quantized::{GgmlDType, QMatMul, QTensor},
    DType, Device, Module, Result, Tensor,
};
use diffusion_engine_common::Precision;

use crate::{QuantMethod, QuantMethodConfig};

#[derive(Debug)]
pub struct GgufMatMul {
    pub(crate) q: Arc<QTensor>,
    pub(crate) w: QMatMul,
    pub(crate) b: Option<Tensor>,
}

impl QuantMethod for GgufMatMul {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::Gguf { q_weight, b } => Ok(Self {
                w: QMatMul::from_arc(q_weight.clone())?,
                q: q_weight,
                b,
            }),
            other => bail!("GgufMatMul cannot be built from {other:?}"),
        }
    }

    fn dequantize_w(&self, out_ty: DType) -> Result<Tensor> {
        self.w.dequantize_f16()?.to_dtype(out_ty)
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let x = self.w.forward(a)?;
        if let Some(ref b) = self.b {
            x.broadcast_add(&b.to_dtype(x.dtype())?)
        } else {
            Ok(x)
        }
    }

    fn quantized_act_type(&self) -> Option<DType> {
        Some(DType::F32)
    }

    fn to_device(&self, dev: &Device) -> Result<Arc<dyn QuantMethod>> {
        let q = Arc::new(QTensor::quantize(&self.q.dequantize(dev)?, self.q.dtype())?);
        let b = if let Some(b) = self.b.as_ref() {
            Some(b.to_device(dev)?)
        } else {
            None
        };
        Ok(Arc::new(Self {
            w: QMatMul::from_arc(q.clone())?,
            q,
            b,
        }))
    }

    fn size_in_bytes(&self) -> Result<usize> {
        let b_size = if let Some(b) = self.b.as_ref() {
            b.dtype().size_in_bytes() * b.elem_count()
        } else {
            0
        };
        Ok(self.q.storage_size_in_bytes() + b_size)
    }

    fn device(&self) -> Device {
        self.q.device()
    }

    /// 8-bit blocks report `Int8`; everything else reports the dequantized compute type.
    fn precision(&self) -> Precision {
        match self.q.dtype() {
            GgmlDType::Q8_0 | GgmlDType::Q8_1 | GgmlDType::Q8K => Precision::Int8,
            GgmlDType::F16 => Precision::F16,
            _ => Precision::F32,
        }
    }

    fn bias(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }

    fn is_gguf(&self) -> bool {
        true
    }
}
