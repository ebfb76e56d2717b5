use std::sync::atomic::{AtomicUsize, Ordering};

use crate::api::error::{KernelError, KernelResult};

/// Element count (rows * cols) at which GEMV switches to the rayon row-parallel path.
pub(crate) static GEMV_PAR_THRESHOLD: AtomicUsize = AtomicUsize::new(1 << 16);

pub(crate) fn gemv_par_threshold() -> usize {
    GEMV_PAR_THRESHOLD.load(Ordering::Relaxed)
}

/// Runtime configuration for kernel parallelism.
/// Must be applied (via `apply()`) before training or serving starts to take effect.
pub struct KernelConfig {
    /// Number of rayon threads. 0 keeps rayon's default (all available cores).
    pub num_threads: usize,
    /// Minimum rows * cols for the parallel GEMV path (default 65536).
    pub gemv_par_threshold: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            gemv_par_threshold: 1 << 16,
        }
    }
}

impl KernelConfig {
    /// Apply this configuration globally.
    ///
    /// Configuring the rayon pool can only happen once per process; a second
    /// attempt with an explicit thread count returns `KernelError::Runtime`.
    pub fn apply(&self) -> KernelResult<()> {
        if self.num_threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .build_global()
                .map_err(|e| KernelError::Runtime(format!("rayon thread pool: {}", e)))?;
        }
        GEMV_PAR_THRESHOLD.store(self.gemv_par_threshold.max(1), Ordering::Relaxed);

        log::info!(
            "[kernels] SIMD: {}, rayon threads: {}, gemv parallel threshold: {}",
            Self::detect_simd(),
            rayon::current_num_threads(),
            self.gemv_par_threshold,
        );
        Ok(())
    }

    /// Detect the SIMD path the dot-product kernels will take.
    pub fn detect_simd() -> &'static str {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return "AVX2+FMA";
            }
            "scalar"
        }
        #[cfg(target_arch = "aarch64")]
        {
            "NEON"
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            "scalar"
        }
    }
}
