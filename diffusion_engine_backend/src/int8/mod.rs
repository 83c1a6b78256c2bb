use std::sync::Arc;

use candle_core::{
    bail,
    quantized::{GgmlDType, QMatMul, QTensor},
    DType, Device, Module, Result, Tensor,
};
use diffusion_engine_common::Precision;

use crate::{QuantMethod, QuantMethodConfig};

/// Weight-only int8: GGML `Q8_0` blocks (32 weights, one f16 scale each).
#[derive(Debug)]
pub struct Int8Linear {
    w: Arc<QTensor>,
    mm: QMatMul,
    b: Option<Tensor>,
}

impl Int8Linear {
    fn from_qtensor(w: Arc<QTensor>, b: Option<Tensor>) -> Result<Self> {
        let mm = QMatMul::from_arc(w.clone())?;
        Ok(Self { w, mm, b })
    }
}

impl QuantMethod for Int8Linear {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::Int8 { weight, bias } => {
                let q = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
                Self::from_qtensor(Arc::new(q), bias)
            }
            other => bail!("Int8Linear cannot be built from {other:?}"),
        }
    }

    fn dequantize_w(&self, out_ty: DType) -> Result<Tensor> {
        self.w.dequantize(&self.w.device())?.to_dtype(out_ty)
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let x = self.mm.forward(a)?;
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
        let w = QTensor::quantize(&self.w.dequantize(dev)?, self.w.dtype())?;
        let b = if let Some(b) = self.b.as_ref() {
            Some(b.to_device(dev)?)
        } else {
            None
        };
        Ok(Arc::new(Self::from_qtensor(Arc::new(w), b)?))
    }

    fn size_in_bytes(&self) -> Result<usize> {
        let b_size = if let Some(b) = self.b.as_ref() {
            b.dtype().size_in_bytes() * b.elem_count()
        } else {
            0
        };
        Ok(self.w.storage_size_in_bytes() + b_size)
    }

    fn device(&self) -> Device {
        self.w.device()
    }

    fn precision(&self) -> Precision {
        Precision::Int8
    }

    fn bias(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }
}
