use candle_core::{DType, Device, Error, Result, Tensor};
use diffusion_engine_common::Precision;
use tracing::info;

#[cfg(feature = "cuda")]
fn candidates(device: &Device, silent: bool) -> Vec<DType> {
    use std::process::Command;

    // >= is supported
    const MIN_BF16_CC: usize = 800;
    // >= is supported
    const MIN_F16_CC: usize = 530;

    if !device.is_cuda() {
        return vec![DType::BF16, DType::F16];
    }
    let Ok(out) = Command::new("nvidia-smi")
        .arg("--query-gpu=compute_cap")
        .arg("--format=csv")
        .output()
    else {
        return vec![DType::BF16, DType::F16];
    };
    let out = String::from_utf8_lossy(&out.stdout);
    let Some(min_cc) = out
        .split('\n')
        .skip(1)
        .filter_map(|cc| cc.trim().parse::<f32>().ok())
        .reduce(f32::min)
    else {
        return vec![DType::BF16, DType::F16];
    };
    if !silent {
        info!("detected minimum CUDA compute capability {min_cc}");
    }
    // 7.5 -> 750
    #[allow(clippy::cast_possible_truncation)]
    let min_cc = (min_cc * 100.) as usize;

    let mut dtypes = Vec::new();
    if min_cc >= MIN_BF16_CC {
        dtypes.push(DType::BF16);
    } else if !silent {
        info!("skipping BF16 because CC < 8.0");
    }
    if min_cc >= MIN_F16_CC {
        dtypes.push(DType::F16);
    } else if !silent {
        info!("skipping F16 because CC < 5.3");
    }
    dtypes
}

#[cfg(not(feature = "cuda"))]
fn candidates(_device: &Device, _silent: bool) -> Vec<DType> {
    vec![DType::BF16, DType::F16]
}

fn probe_auto(device: &Device, silent: bool) -> Result<DType> {
    for dtype in candidates(device, silent) {
        // Try a matmul
        let probe = Tensor::zeros((2, 2), dtype, device).and_then(|x| x.matmul(&x));
        match probe {
            Ok(_) => return Ok(dtype),
            Err(e) => match e {
                // For CUDA
                Error::UnsupportedDTypeForOp(_, _) => continue,
                // Accelerate backend doesn't support f16/bf16
                // Metal backend doesn't support f16
                Error::Msg(_) => continue,
                // If running with RUST_BACKTRACE=1
                Error::WithBacktrace { .. } => continue,
                #[cfg(feature = "metal")]
                // This is when the metal backend doesn't support bf16
                Error::Metal(_) => continue,
                other => return Err(other),
            },
        }
    }
    Ok(DType::F32)
}

/// Compute dtype for `precision` on `device`.
///
/// `Auto` probes BF16 then F16 with a small matmul and falls back to F32.
/// Quantized precisions compute in BF16.
pub fn resolve_precision(precision: Precision, device: &Device, silent: bool) -> Result<DType> {
    let dtype = match precision {
        Precision::Auto => probe_auto(device, silent)?,
        other => other.compute_dtype().unwrap_or(DType::BF16),
    };
    if !silent {
        info!("dtype selected is {dtype:?}.");
    }
    Ok(dtype)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use diffusion_engine_common::Precision;

    use super::resolve_precision;

    #[test]
    fn explicit_precisions_pass_through() {
        let dev = Device::Cpu;
        assert_eq!(resolve_precision(Precision::F32, &dev, true).unwrap(), DType::F32);
        assert_eq!(resolve_precision(Precision::F16, &dev, true).unwrap(), DType::F16);
    }

    #[test]
    fn auto_picks_a_float_type() {
        let dtype = resolve_precision(Precision::Auto, &Device::Cpu, true).unwrap();
        assert!(matches!(dtype, DType::BF16 | DType::F16 | DType::F32));
    }
}
