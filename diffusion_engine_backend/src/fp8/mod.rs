use std::sync::Arc;

use candle_core::{bail, DType, Device, Result, Shape, Tensor};
use diffusion_engine_common::Precision;
use float8::F8E4M3;

use crate::{unquantized::matmul_weight, QuantMethod, QuantMethodConfig};

const F8E4M3_MAX: f32 = 448.;

/// Weight-only float8: weights kept as E4M3 on the host with one per-tensor
/// scale, dequantized to the activation dtype on each call.
#[derive(Debug)]
pub struct Fp8Linear {
    w: Arc<Vec<F8E4M3>>,
    shape: Shape,
    scale: f32,
    b: Option<Tensor>,
    device: Device,
}

fn quantize_fp8(weight: &Tensor) -> Result<(Vec<F8E4M3>, f32)> {
    let data = weight
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let amax = data.iter().fold(0f32, |m, x| m.max(x.abs()));
    if !amax.is_finite() {
        bail!("cannot quantize non-finite weights to float8");
    }
    let scale = if amax == 0. { 1. } else { amax / F8E4M3_MAX };
    let packed = data.iter().map(|x| F8E4M3::from_f32(x / scale)).collect();
    Ok((packed, scale))
}

impl QuantMethod for Fp8Linear {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::Fp8 { weight, bias } => {
                let (w, scale) = quantize_fp8(&weight)?;
                Ok(Self {
                    w: Arc::new(w),
                    shape: weight.shape().clone(),
                    scale,
                    b: bias,
                    device: weight.device().clone(),
                })
            }
            other => bail!("Fp8Linear cannot be built from {other:?}"),
        }
    }

    fn dequantize_w(&self, out_ty: DType) -> Result<Tensor> {
        let data = self
            .w
            .iter()
            .map(|x| x.to_f32() * self.scale)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, self.shape.clone(), &self.device)?.to_dtype(out_ty)
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let w = self.dequantize_w(a.dtype())?;
        matmul_weight(a, &w, self.b.as_ref())
    }

    fn quantized_act_type(&self) -> Option<DType> {
        None
    }

    fn to_device(&self, dev: &Device) -> Result<Arc<dyn QuantMethod>> {
        let b = if let Some(b) = self.b.as_ref() {
            Some(b.to_device(dev)?)
        } else {
            None
        };
        Ok(Arc::new(Self {
            w: self.w.clone(),
            shape: self.shape.clone(),
            scale: self.scale,
            b,
            device: dev.clone(),
        }))
    }

    fn size_in_bytes(&self) -> Result<usize> {
        let b_size = if let Some(b) = self.b.as_ref() {
            b.dtype().size_in_bytes() * b.elem_count()
        } else {
            0
        };
        Ok(self.w.len() + std::mem::size_of::<f32>() + b_size)
    }

    fn device(&self) -> Device {
        self.device.clone()
    }

    fn precision(&self) -> Precision {
        Precision::F8E4M3
    }

    fn bias(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }
}
