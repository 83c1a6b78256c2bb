use candle_core::{DType, Device, Tensor};

use crate::error::{EngineError, Result};

/// Contiguous row-major float32 output handed back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl SampleBuffer {
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let t = t.to_dtype(DType::F32)?.contiguous()?;
        let shape = t.dims().to_vec();
        let data = t.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { shape, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Caller-supplied image, `(1, C, H, W)` with values in `[-1, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl FlatTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }
}

/// Decoded input images.
#[derive(Clone, Debug)]
pub enum ImageInput {
    Single(Tensor),
    Many(Vec<Tensor>),
}

impl ImageInput {
    pub fn first(&self) -> Option<&Tensor> {
        match self {
            Self::Single(t) => Some(t),
            Self::Many(ts) => ts.first(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(1, C, H, W)` in `[-1, 1]` to an `(H, W, C)` tensor in `[0, 255]`.
pub fn decode_image(image: &FlatTensor, device: &Device) -> Result<Tensor> {
    let expected: usize = image.shape.iter().product();
    if image.shape.is_empty() || expected != image.data.len() {
        return Err(EngineError::Configuration(format!(
            "image buffer has {} values but shape {:?}",
            image.data.len(),
            image.shape
        )));
    }
    let t = Tensor::from_slice(&image.data, image.shape.as_slice(), device)?;
    let t = match t.rank() {
        4 => t.get(0)?,
        3 => t,
        r => {
            return Err(EngineError::Configuration(format!(
                "image must be rank 3 or 4, got rank {r}"
            )))
        }
    };
    let t = ((t + 1.)? / 2.)?
        .clamp(0f32, 1f32)?
        .permute((1, 2, 0))?
        .affine(255., 0.)?
        .round()?;
    Ok(t)
}

/// Decode every non-empty buffer. No input, or only empty entries, is `None`.
pub fn prepare_images(images: Option<&[FlatTensor]>, device: &Device) -> Result<Option<ImageInput>> {
    let Some(images) = images else {
        return Ok(None);
    };
    let mut decoded = images
        .iter()
        .filter(|i| !i.data.is_empty())
        .map(|i| decode_image(i, device))
        .collect::<Result<Vec<_>>>()?;
    Ok(match decoded.len() {
        0 => None,
        1 => decoded.pop().map(ImageInput::Single),
        _ => Some(ImageInput::Many(decoded)),
    })
}
