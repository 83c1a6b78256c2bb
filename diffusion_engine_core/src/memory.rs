use diffusion_engine_common::MemoryMode;
use tracing::{debug, warn};

use crate::runtime::PipelineRuntime;

/// Where sub-model weights live between phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffloadStrategy {
    /// Everything stays on the device.
    None,
    /// Each layer moves to the device only while it executes.
    Sequential,
    /// Each sub-model moves to the device only while its phase runs.
    Model,
}

/// Placement derived from a [`MemoryMode`]. Offload and VAE slicing/tiling are independent axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryPlacement {
    pub offload: OffloadStrategy,
    pub vae_slicing: bool,
    pub vae_tiling: bool,
    pub multi_device: bool,
}

impl MemoryPlacement {
    pub fn from_mode(mode: MemoryMode) -> Self {
        let offload = match mode {
            MemoryMode::Device | MemoryMode::LowMemDevice | MemoryMode::MultiDevice => {
                OffloadStrategy::None
            }
            MemoryMode::OffloadModel | MemoryMode::LowMemOffloadModel => OffloadStrategy::Model,
            MemoryMode::OffloadCPU => OffloadStrategy::Sequential,
        };
        Self {
            offload,
            vae_slicing: mode.is_low_memory(),
            vae_tiling: mode.is_low_memory(),
            multi_device: mode == MemoryMode::MultiDevice,
        }
    }

    pub fn is_offload(&self) -> bool {
        self.offload != OffloadStrategy::None
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_process_heap() -> bool {
    // SAFETY: malloc_trim only walks the allocator's own free lists.
    unsafe { libc::malloc_trim(0) != 0 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_process_heap() -> bool {
    warn!("[Memory] MemoryReclaimWarning: working-set trim is not supported on this platform");
    false
}

/// Best-effort cleanup after a phase. Never fails.
///
/// Clears the runtime's caches, then for offload modes returns freed heap to the OS.
pub fn reclaim_memory(runtime: Option<&mut (dyn PipelineRuntime + '_)>, is_offload: bool) {
    if let Some(runtime) = runtime {
        if let Err(e) = runtime.empty_cache() {
            warn!("[Memory] MemoryReclaimWarning: cache clear failed: {e}");
        }
    }
    if is_offload {
        let released = trim_process_heap();
        debug!("[Memory] Heap trim released memory: {released}");
    }
}

#[cfg(test)]
mod tests {
    use diffusion_engine_common::MemoryMode;

    use super::{MemoryPlacement, OffloadStrategy};

    #[test]
    fn offload_and_slicing_are_independent() {
        let p = MemoryPlacement::from_mode(MemoryMode::Device);
        assert_eq!(p.offload, OffloadStrategy::None);
        assert!(!p.vae_slicing && !p.vae_tiling && !p.is_offload());

        let p = MemoryPlacement::from_mode(MemoryMode::LowMemDevice);
        assert_eq!(p.offload, OffloadStrategy::None);
        assert!(p.vae_slicing && p.vae_tiling);

        let p = MemoryPlacement::from_mode(MemoryMode::LowMemOffloadModel);
        assert_eq!(p.offload, OffloadStrategy::Model);
        assert!(p.vae_slicing && p.is_offload());

        let p = MemoryPlacement::from_mode(MemoryMode::OffloadCPU);
        assert_eq!(p.offload, OffloadStrategy::Sequential);
        assert!(!p.vae_tiling);

        let p = MemoryPlacement::from_mode(MemoryMode::MultiDevice);
        assert!(p.multi_device && !p.is_offload());
    }

    #[test]
    fn reclaim_without_runtime_is_harmless() {
        super::reclaim_memory(None, true);
        super::reclaim_memory(None, false);
    }
}
