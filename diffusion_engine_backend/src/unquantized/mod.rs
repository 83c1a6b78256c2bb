use std::sync::Arc;

use candle_core::{bail, DType, Device, Result, Tensor};
use diffusion_engine_common::Precision;

use crate::{QuantMethod, QuantMethodConfig};

pub(crate) fn matmul_weight(a: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Result<Tensor> {
    let w = match *a.dims() {
        [b1, b2, _, _] => w.broadcast_left((b1, b2))?,
        [bsize, _, _] => w.broadcast_left(bsize)?,
        _ => w.clone(),
    };
    let x = a.matmul(&w.t()?)?;
    match b {
        Some(b) => x.broadcast_add(&b.to_dtype(x.dtype())?),
        None => Ok(x),
    }
}

#[derive(Debug)]
pub struct UnquantLinear {
    w: Tensor,
    b: Option<Tensor>,
}

impl QuantMethod for UnquantLinear {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::Unquantized { weight, bias } => Ok(Self { w: weight, b: bias }),
            other => bail!("UnquantLinear cannot be built from {other:?}"),
        }
    }

    fn dequantize_w(&self, out_ty: DType) -> Result<Tensor> {
        self.w.to_dtype(out_ty)
    }

    fn bias(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        matmul_weight(a, &self.w.to_dtype(a.dtype())?, self.b.as_ref())
    }

    fn quantized_act_type(&self) -> Option<DType> {
        None
    }

    fn to_device(&self, dev: &Device) -> Result<Arc<dyn QuantMethod>> {
        let w = self.w.to_device(dev)?;
        let b = if let Some(b) = self.b.as_ref() {
            Some(b.to_device(dev)?)
        } else {
            None
        };
        Ok(Arc::new(Self { w, b }))
    }

    fn size_in_bytes(&self) -> Result<usize> {
        let w_size = self.w.dtype().size_in_bytes() * self.w.elem_count();
        let b_size = if let Some(b) = self.b.as_ref() {
            b.dtype().size_in_bytes() * b.elem_count()
        } else {
            0
        };
        Ok(w_size + b_size)
    }

    fn device(&self) -> Device {
        self.w.device().clone()
    }

    fn precision(&self) -> Precision {
        self.w.dtype().into()
    }
}
