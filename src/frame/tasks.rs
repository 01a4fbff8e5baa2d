//! Task graphs of a released frame.
//!
//! An enhanced frame runs, per plane, the cascade
//! `ConvertToInternal -> [Upsample LOQ2->LOQ1] -> [LOQ1 residuals] ->
//! [Upsample LOQ1->LOQ0] -> [temporal or direct LOQ0 residuals] ->
//! ConvertFromInternal`, followed by `OutputDone` over all planes and
//! `BaseDone` over every reader of the base picture. A copied frame runs one
//! `Passthrough` task per plane instead of the cascade.
//!
//! Bodies check the frame's skip flag on entry and return without touching
//! pixels when it is set. Residual decoding and temporal application run
//! regardless, so temporal state stays consistent for later frames.

use crate::{
    backend::{ApplyOptions, KernelError, PixelBackend},
    enhancement::{CommandBuffer, FrameConfig, GlobalConfig, ScalingMode},
    executor::{GraphError, GraphRef},
    frame::{FrameId, GraphKind, Resource},
    picture::{SharedPlane, shared_plane},
    pipeline::Shared,
    task::Token,
    temporal::TemporalRequirement,
    types::{Loq, MAX_PLANES, NUM_LOQS, Timestamp},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, error, warn};

/// Everything needed to build the task graph of a frame leaving the reorder
/// window.
#[derive(Debug)]
pub(crate) struct FramePlan {
    pub(crate) id: FrameId,
    pub(crate) timestamp: Timestamp,
    pub(crate) graph: GraphRef<Resource>,
    pub(crate) base_token: Token,
    pub(crate) output_token: Token,
    pub(crate) skip: Arc<AtomicBool>,
    pub(crate) kind: GraphKind,
    pub(crate) passthrough: bool,
    pub(crate) global: Option<Arc<GlobalConfig>>,
    pub(crate) config: Arc<FrameConfig>,
    /// Per plane, the latest earlier frame that released temporal state.
    pub(crate) previous: [Option<Timestamp>; MAX_PLANES],
}

impl FramePlan {
    /// Whether `plane` reads and releases a temporal buffer.
    pub(crate) fn uses_temporal(&self, plane: usize) -> bool {
        self.kind == GraphKind::Enhancement
            && !self.passthrough
            && self.global.as_ref().is_some_and(|global| {
                global.temporal_enabled
                    && plane < global.num_planes
                    && plane < global.format.num_planes()
            })
    }
}

/// Captured by every task body of one frame.
#[derive(Debug)]
struct FrameContext {
    shared: Arc<Shared>,
    id: FrameId,
    timestamp: Timestamp,
    skip: Arc<AtomicBool>,
}

impl FrameContext {
    fn skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    fn backend(&self) -> &dyn PixelBackend {
        &*self.shared.backend
    }

    fn report(&self, task: &'static str, plane: usize, result: Result<(), KernelError>) {
        if let Err(error) = result {
            error!(timestamp = self.timestamp, plane, task, %error, "kernel failed");
        }
    }
}

/// Add every task of `plan` to its graph.
///
/// With `show_tasks` the graph is held back until it is fully built and
/// then logged, so the dump shows every task before any has run.
pub(crate) fn generate(
    shared: &Arc<Shared>,
    plan: &FramePlan,
    show_tasks: bool,
) -> Result<(), GraphError> {
    let builder = GraphBuilder {
        plan,
        graph: &plan.graph,
        ctx: Arc::new(FrameContext {
            shared: shared.clone(),
            id: plan.id,
            timestamp: plan.timestamp,
            skip: plan.skip.clone(),
        }),
    };
    if show_tasks {
        plan.graph.block();
    }
    let result = match (plan.kind, &plan.global) {
        (GraphKind::Enhancement, Some(global)) => builder.enhancement(global),
        _ => builder.copy(),
    };
    if show_tasks {
        debug!(timestamp = plan.timestamp, "task graph\n{}", plan.graph.describe());
        plan.graph.unblock();
    }
    result
}

struct GraphBuilder<'a> {
    plan: &'a FramePlan,
    graph: &'a GraphRef<Resource>,
    ctx: Arc<FrameContext>,
}

/// Intermediate planes of one picture plane, indexed by [`Loq::index`].
/// Levels not separated by scaling share a buffer.
fn intermediate_planes(global: &GlobalConfig, plane: usize) -> [SharedPlane; NUM_LOQS] {
    let new_plane = |loq| {
        let (width, height) = global.loq_size(loq, plane);
        shared_plane(width, height)
    };
    let loq0 = new_plane(Loq::Loq0);
    let loq1 = if global.has_own_buffer(Loq::Loq1) {
        new_plane(Loq::Loq1)
    } else {
        loq0.clone()
    };
    let loq2 = if global.has_own_buffer(Loq::Loq2) {
        new_plane(Loq::Loq2)
    } else {
        loq1.clone()
    };
    [loq0, loq1, loq2]
}

impl GraphBuilder<'_> {
    fn enhancement(&self, global: &Arc<GlobalConfig>) -> Result<(), GraphError> {
        let config = &self.plan.config;
        let num_planes = global.format.num_planes();
        let mut outputs = Vec::with_capacity(num_planes);
        for plane in 0..num_planes {
            let buffers = intermediate_planes(global, plane);
            let [loq0, loq1, loq2] = &buffers;
            let enhanced = |loq| {
                !self.plan.passthrough && plane < global.num_planes && config.loq_enabled(loq)
            };

            let mut recon = self.convert_to_internal(plane, loq2)?;
            if global.scaling_into(Loq::Loq1) != ScalingMode::None {
                recon = self.upsample(global, Loq::Loq1, plane, loq2, loq1, recon)?;
            }
            if enhanced(Loq::Loq1) {
                let input = recon;
                recon = self.residual_tiles(global, Loq::Loq1, plane, |tile, commands| {
                    self.apply_direct(global, Loq::Loq1, plane, tile, loq1, input, commands)
                })?;
            }
            if global.scaling_into(Loq::Loq0) != ScalingMode::None {
                recon = self.upsample(global, Loq::Loq0, plane, loq1, loq0, recon)?;
            }
            if self.plan.uses_temporal(plane) {
                let (width, height) = global.loq_size(Loq::Loq0, plane);
                // Nothing earlier holds state for this plane: start from zero.
                let previous = self.plan.previous[plane];
                let requirement = TemporalRequirement {
                    plane,
                    timestamp: previous,
                    clear: config.temporal_clear() || previous.is_none(),
                    width,
                    height,
                };
                let temporal = self.ctx.shared.require_temporal(
                    self.plan.id,
                    self.graph,
                    requirement,
                )?;
                let mut applied = temporal;
                if enhanced(Loq::Loq0) {
                    applied = self.residual_tiles(global, Loq::Loq0, plane, |tile, commands| {
                        self.apply_temporal(global, plane, tile, temporal, commands)
                    })?;
                }
                recon = self.add_temporal(plane, loq0, applied, temporal, recon)?;
                self.release_temporal(plane, recon)?;
            } else if enhanced(Loq::Loq0) {
                let input = recon;
                recon = self.residual_tiles(global, Loq::Loq0, plane, |tile, commands| {
                    self.apply_direct(global, Loq::Loq0, plane, tile, loq0, input, commands)
                })?;
            }
            outputs.push(self.convert_from_internal(plane, loq0, recon)?);
        }
        self.output_done(&outputs)?;
        self.base_done()
    }

    fn copy(&self) -> Result<(), GraphError> {
        let outputs = (0..MAX_PLANES)
            .map(|plane| self.passthrough(plane))
            .collect::<Result<Vec<_>, _>>()?;
        self.output_done(&outputs)?;
        self.base_done()
    }

    fn convert_to_internal(&self, plane: usize, dst: &SharedPlane) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let dst = dst.clone();
        let base = self.plan.base_token;
        self.graph.add_task(&[base], format!("ConvertToInternal[{plane}]"), move |inputs| {
            if ctx.skipped() {
                return Resource::Empty;
            }
            let Some(picture) = inputs.read(base).and_then(Resource::picture) else {
                return Resource::Empty;
            };
            let Some(src) = picture.plane(plane) else {
                warn!(timestamp = ctx.timestamp, plane, "base picture lacks plane");
                return Resource::Empty;
            };
            let mut dst = dst.lock();
            let result = ctx.backend().convert_format(src.plane_ref(), dst.plane_mut(), plane);
            ctx.report("ConvertToInternal", plane, result);
            Resource::Empty
        })
    }

    /// Upscale into `to` from the level below it.
    fn upsample(
        &self,
        global: &GlobalConfig,
        to: Loq,
        plane: usize,
        src: &SharedPlane,
        dst: &SharedPlane,
        input: Token,
    ) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let (src, dst) = (src.clone(), dst.clone());
        let mode = global.scaling_into(to);
        let kernel = global.kernel;
        let predicted_average = global.predicted_average;
        self.graph.add_task(&[input], format!("Upsample {to}[{plane}]"), move |_| {
            if ctx.skipped() {
                return Resource::Empty;
            }
            let src = src.lock();
            let mut dst = dst.lock();
            let base_for_pa = predicted_average.then(|| src.plane_ref());
            let result = ctx
                .backend()
                .upscale(src.plane_ref(), dst.plane_mut(), base_for_pa, kernel, mode);
            ctx.report("Upsample", plane, result);
            Resource::Empty
        })
    }

    /// Decode and apply every residual tile of `plane` at `loq`. Returns a
    /// token met once all tiles are applied.
    fn residual_tiles(
        &self,
        global: &GlobalConfig,
        loq: Loq,
        plane: usize,
        apply: impl Fn(usize, Token) -> Result<Token, GraphError>,
    ) -> Result<Token, GraphError> {
        let mut tiles = Vec::with_capacity(global.num_tiles);
        for tile in 0..global.num_tiles {
            let commands = self.generate_commands(loq, plane, tile)?;
            tiles.push(apply(tile, commands)?);
        }
        match tiles.as_slice() {
            [single] => Ok(*single),
            _ => self
                .graph
                .add_barrier(&tiles, format!("WaitForMany {loq}[{plane}]")),
        }
    }

    fn generate_commands(&self, loq: Loq, plane: usize, tile: usize) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let payload = self.plan.config.tile_payload(loq, plane, tile).cloned();
        self.graph.add_task(
            &[],
            format!("GenerateCmdBuffer {loq}[{plane}:{tile}]"),
            move |_| {
                let commands = match payload.as_deref().map(CommandBuffer::decode) {
                    Some(Ok(commands)) => commands,
                    Some(Err(error)) => {
                        error!(timestamp = ctx.timestamp, plane, tile, %error, "residual decode failed");
                        CommandBuffer::default()
                    }
                    None => CommandBuffer::default(),
                };
                Resource::Commands(Arc::new(commands))
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_direct(
        &self,
        global: &GlobalConfig,
        loq: Loq,
        plane: usize,
        tile: usize,
        target: &SharedPlane,
        input: Token,
        commands: Token,
    ) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let target = target.clone();
        let options = ApplyOptions {
            tile: global.tile_rect(loq, plane, tile),
            highlight: ctx.shared.highlight_residuals,
        };
        self.graph.add_task(
            &[input, commands],
            format!("ApplyCmdBufferDirect {loq}[{plane}:{tile}]"),
            move |inputs| {
                if ctx.skipped() {
                    return Resource::Empty;
                }
                let Some(buffer) = inputs.read(commands).and_then(Resource::commands) else {
                    return Resource::Empty;
                };
                let mut target = target.lock();
                let result = ctx
                    .backend()
                    .apply_command_buffer(target.plane_mut(), buffer, options);
                ctx.report("ApplyCmdBufferDirect", plane, result);
                Resource::Empty
            },
        )
    }

    fn apply_temporal(
        &self,
        global: &GlobalConfig,
        plane: usize,
        tile: usize,
        temporal: Token,
        commands: Token,
    ) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let options = ApplyOptions {
            tile: global.tile_rect(Loq::Loq0, plane, tile),
            highlight: ctx.shared.highlight_residuals,
        };
        self.graph.add_task(
            &[temporal, commands],
            format!("ApplyCmdBufferTemporal[{plane}:{tile}]"),
            move |inputs| {
                let buffer = inputs.read(commands).and_then(Resource::commands);
                let target = inputs.read(temporal).and_then(Resource::plane);
                let (Some(buffer), Some(target)) = (buffer, target) else {
                    return Resource::Empty;
                };
                let mut target = target.lock();
                let result = ctx
                    .backend()
                    .apply_command_buffer(target.plane_mut(), buffer, options);
                ctx.report("ApplyCmdBufferTemporal", plane, result);
                Resource::Empty
            },
        )
    }

    fn add_temporal(
        &self,
        plane: usize,
        dst: &SharedPlane,
        applied: Token,
        temporal: Token,
        recon: Token,
    ) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let dst = dst.clone();
        let mut inputs = vec![applied, recon];
        if applied != temporal {
            inputs.push(temporal);
        }
        self.graph.add_task(&inputs, format!("ApplyAddTemporal[{plane}]"), move |inputs| {
            if ctx.skipped() {
                return Resource::Empty;
            }
            let Some(addend) = inputs.read(temporal).and_then(Resource::plane) else {
                return Resource::Empty;
            };
            let addend = addend.lock();
            let mut dst = dst.lock();
            let result = ctx.backend().add_planes(addend.plane_ref(), dst.plane_mut());
            ctx.report("ApplyAddTemporal", plane, result);
            Resource::Empty
        })
    }

    fn release_temporal(&self, plane: usize, after: Token) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        self.graph.add_task(&[after], format!("TemporalRelease[{plane}]"), move |_| {
            ctx.shared.release_temporal(ctx.id, plane);
            Resource::Empty
        })
    }

    fn convert_from_internal(
        &self,
        plane: usize,
        src: &SharedPlane,
        recon: Token,
    ) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let src = src.clone();
        let output = self.plan.output_token;
        self.graph.add_task(
            &[output, recon],
            format!("ConvertFromInternal[{plane}]"),
            move |inputs| {
                if ctx.skipped() {
                    return Resource::Empty;
                }
                let Some(picture) = inputs.read(output).and_then(Resource::picture) else {
                    return Resource::Empty;
                };
                let Some(mut dst) = picture.plane(plane) else {
                    return Resource::Empty;
                };
                let src = src.lock();
                let result = ctx.backend().convert_format(src.plane_ref(), dst.plane_mut(), plane);
                ctx.report("ConvertFromInternal", plane, result);
                Resource::Empty
            },
        )
    }

    fn passthrough(&self, plane: usize) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        let (base, output) = (self.plan.base_token, self.plan.output_token);
        self.graph.add_task(&[base, output], format!("Passthrough[{plane}]"), move |inputs| {
            if ctx.skipped() {
                return Resource::Empty;
            }
            let src = inputs.read(base).and_then(Resource::picture);
            let dst = inputs.read(output).and_then(Resource::picture);
            let (Some(src), Some(dst)) = (src, dst) else {
                return Resource::Empty;
            };
            if src == dst {
                return Resource::Empty;
            }
            let (Some(src), Some(mut dst)) = (src.plane(plane), dst.plane(plane)) else {
                return Resource::Empty;
            };
            let result = ctx.backend().convert_format(src.plane_ref(), dst.plane_mut(), plane);
            ctx.report("Passthrough", plane, result);
            Resource::Empty
        })
    }

    fn output_done(&self, outputs: &[Token]) -> Result<Token, GraphError> {
        let ctx = self.ctx.clone();
        self.graph.add_task(outputs, "OutputDone", move |_| {
            ctx.shared.frame_done(ctx.id);
            Resource::Empty
        })
    }

    fn base_done(&self) -> Result<(), GraphError> {
        let ctx = self.ctx.clone();
        let readers = self.graph.outputs_consuming(self.plan.base_token);
        self.graph.add_task(&readers, "BaseDone", move |_| {
            ctx.shared.base_done(ctx.id);
            Resource::Empty
        })?;
        Ok(())
    }
}
