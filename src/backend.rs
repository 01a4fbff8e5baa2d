mod cpu;

pub use crate::backend::cpu::{CpuBackend, INTERNAL_SHIFT};
use crate::{
    enhancement::{CommandBuffer, ScalingMode, TileRect, UpscaleKernel},
    picture::{PlaneMut, PlaneRef},
    types::IndexMap,
};
use core::fmt::Debug;
use std::{borrow::Cow, sync::Arc};
use thiserror::Error;

/// Failure of a pixel kernel.
///
/// Kernels report failure instead of panicking; the task that invoked them
/// logs the error and leaves its output region untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KernelError {
    /// Source and destination sizes are incompatible.
    #[error("plane size mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        /// Size the kernel required.
        expected: (u32, u32),
        /// Size it was given.
        actual: (u32, u32),
    },
    /// A plane descriptor claims more samples than its storage holds.
    #[error("plane descriptor exceeds its storage")]
    InvalidDescriptor,
    /// The kernel does not handle this sample type combination.
    #[error("unsupported sample format for {0}")]
    UnsupportedFormat(&'static str),
    /// A residual addresses a sample outside its tile.
    #[error("residual at ({x}, {y}) lies outside its tile")]
    OutOfTile {
        /// Column relative to the tile.
        x: u16,
        /// Row relative to the tile.
        y: u16,
    },
    /// Upscale requested with [`ScalingMode::None`].
    #[error("upscale called without scaling")]
    NoScaling,
}

/// Per-call options of [`PixelBackend::apply_command_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOptions {
    /// Region the residual coordinates are relative to.
    pub tile: TileRect,
    /// Overwrite every touched sample with a saturated value instead of
    /// applying the residual, to make residual placement visible.
    pub highlight: bool,
}

/// Numeric kernels invoked by frame tasks.
///
/// Implementations are stateless; every call works only on the planes it is
/// handed. The scheduler treats each call as one task body.
pub trait PixelBackend: Debug + Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Copy `src` into `dst`, converting between picture samples and the
    /// internal fixed-point representation as the sample types require.
    ///
    /// # Errors
    /// If sizes differ or a descriptor is inconsistent.
    fn convert_format(
        &self,
        src: PlaneRef<'_>,
        dst: PlaneMut<'_>,
        plane: usize,
    ) -> Result<(), KernelError>;

    /// Upscale `src` into `dst` according to `mode`. With `base_for_pa`, the
    /// average of every upscaled block is corrected back to the matching
    /// sample of that plane.
    ///
    /// # Errors
    /// If `dst` is not the upscaled size of `src`, or samples are not
    /// internal fixed point.
    fn upscale(
        &self,
        src: PlaneRef<'_>,
        dst: PlaneMut<'_>,
        base_for_pa: Option<PlaneRef<'_>>,
        kernel: UpscaleKernel,
        mode: ScalingMode,
    ) -> Result<(), KernelError>;

    /// Apply the residuals of one tile to `target`.
    ///
    /// Either every residual is applied or, on error, none is.
    ///
    /// # Errors
    /// If a residual falls outside the tile or the tile outside `target`.
    fn apply_command_buffer(
        &self,
        target: PlaneMut<'_>,
        commands: &CommandBuffer,
        options: ApplyOptions,
    ) -> Result<(), KernelError>;

    /// `dst = dst + addend`, saturating.
    ///
    /// # Errors
    /// If sizes differ or samples are not internal fixed point.
    fn add_planes(&self, addend: PlaneRef<'_>, dst: PlaneMut<'_>) -> Result<(), KernelError>;
}

/// Capability tag a backend is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum BackendTag {
    /// Single-threaded reference kernels.
    #[display("scalar")]
    Scalar,
    /// Kernels that split rows across a data-parallel thread pool.
    #[display("parallel")]
    Parallel,
    /// Externally supplied backend.
    #[display("{_0}")]
    Custom(Cow<'static, str>),
}

/// Lookup from capability tag to kernel implementation, built once when the
/// pipeline is created.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: IndexMap<BackendTag, Arc<dyn PixelBackend>>,
    preferred: Option<BackendTag>,
}

impl BackendRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the scalar and parallel CPU backends.
    #[must_use]
    pub fn with_cpu() -> Self {
        let mut registry = Self::new();
        registry.register(BackendTag::Scalar, Arc::new(CpuBackend::scalar()));
        registry.register(BackendTag::Parallel, Arc::new(CpuBackend::parallel()));
        registry
    }

    /// Register `backend` under `tag`, returning the one it replaces.
    pub fn register(
        &mut self,
        tag: BackendTag,
        backend: Arc<dyn PixelBackend>,
    ) -> Option<Arc<dyn PixelBackend>> {
        self.backends.insert(tag, backend)
    }

    /// Prefer `tag` over the built-in choice in [`BackendRegistry::select`].
    pub fn prefer(&mut self, tag: BackendTag) {
        self.preferred = Some(tag);
    }

    /// Backend registered under `tag`.
    #[must_use]
    pub fn get(&self, tag: &BackendTag) -> Option<Arc<dyn PixelBackend>> {
        self.backends.get(tag).cloned()
    }

    /// Registered tags in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &BackendTag> {
        self.backends.keys()
    }

    /// Pick the backend a pipeline should use.
    ///
    /// `force_scalar` selects [`BackendTag::Scalar`]. Otherwise the preferred
    /// tag wins, then [`BackendTag::Parallel`], then scalar, then whatever was
    /// registered first.
    #[must_use]
    pub fn select(&self, force_scalar: bool) -> Option<(BackendTag, Arc<dyn PixelBackend>)> {
        let candidates = if force_scalar {
            vec![Some(BackendTag::Scalar)]
        } else {
            vec![
                self.preferred.clone(),
                Some(BackendTag::Parallel),
                Some(BackendTag::Scalar),
            ]
        };
        candidates
            .into_iter()
            .flatten()
            .find_map(|tag| self.backends.get(&tag).map(|backend| (tag, backend.clone())))
            .or_else(|| {
                self.backends
                    .first()
                    .map(|(tag, backend)| (tag.clone(), backend.clone()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_honours_force_scalar_and_preference() {
        let mut registry = BackendRegistry::with_cpu();
        assert_eq!(registry.select(false).map(|(tag, _)| tag), Some(BackendTag::Parallel));
        assert_eq!(registry.select(true).map(|(tag, _)| tag), Some(BackendTag::Scalar));

        let custom = BackendTag::Custom("mine".into());
        registry.register(custom.clone(), Arc::new(CpuBackend::scalar()));
        registry.prefer(custom.clone());
        assert_eq!(registry.select(false).map(|(tag, _)| tag), Some(custom));
        assert_eq!(registry.select(true).map(|(tag, _)| tag), Some(BackendTag::Scalar));
    }

    #[test]
    fn empty_registry_selects_nothing() {
        assert!(BackendRegistry::new().select(false).is_none());
        let mut registry = BackendRegistry::new();
        let only = BackendTag::Custom("only".into());
        registry.register(only.clone(), Arc::new(CpuBackend::scalar()));
        // Falls back to the first registration even when scalar is forced.
        assert_eq!(registry.select(true).map(|(tag, _)| tag), Some(only));
    }
}
