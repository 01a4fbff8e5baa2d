use crate::{
    backend::{ApplyOptions, KernelError, PixelBackend},
    enhancement::{CommandBuffer, ResidualOp, ScalingMode, UpscaleKernel},
    picture::{PlaneMut, PlaneRef, Samples, SamplesMut},
};
use rayon::prelude::*;

/// Left shift from 8-bit picture samples to internal fixed point.
pub const INTERNAL_SHIFT: u32 = 7;

const HIGHLIGHT: i16 = 255 << INTERNAL_SHIFT;
/// Planes with fewer rows are always processed on the calling thread.
const PARALLEL_MIN_ROWS: usize = 64;

/// Reference CPU kernels.
///
/// The parallel flavour splits row loops across the `rayon` pool once a plane
/// is tall enough; results are identical to the scalar flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackend {
    parallel: bool,
}

impl CpuBackend {
    /// Kernels that run entirely on the calling thread.
    #[must_use]
    pub const fn scalar() -> Self {
        Self { parallel: false }
    }

    /// Kernels that spread rows across the `rayon` thread pool.
    #[must_use]
    pub const fn parallel() -> Self {
        Self { parallel: true }
    }

    /// Run `f(index, chunk)` over consecutive `chunk_len`-sized chunks of
    /// `data`, at most `count` of them.
    fn for_each_chunk<T: Send>(
        &self,
        data: &mut [T],
        chunk_len: usize,
        count: usize,
        f: impl Fn(usize, &mut [T]) + Send + Sync,
    ) {
        if chunk_len == 0 || count == 0 {
            return;
        }
        let len = data.len().min(chunk_len * count);
        let data = &mut data[..len];
        if self.parallel && count >= PARALLEL_MIN_ROWS {
            data.par_chunks_mut(chunk_len)
                .enumerate()
                .for_each(|(idx, chunk)| f(idx, chunk));
        } else {
            data.chunks_mut(chunk_len)
                .enumerate()
                .for_each(|(idx, chunk)| f(idx, chunk));
        }
    }
}

fn check_layout(len: usize, stride: usize, width: u32, height: u32) -> Result<(), KernelError> {
    if width == 0 || height == 0 {
        return Ok(());
    }
    let needed = (height as usize - 1) * stride + width as usize;
    if (width as usize) > stride || len < needed {
        return Err(KernelError::InvalidDescriptor);
    }
    Ok(())
}

fn same_size(expected: (u32, u32), actual: (u32, u32)) -> Result<(), KernelError> {
    if expected != actual {
        return Err(KernelError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

fn row<T>(data: &[T], stride: usize, y: usize, width: usize) -> &[T] {
    &data[y * stride..][..width]
}

/// `(3 * near + far) / 4`, rounded.
#[allow(clippy::cast_possible_truncation)]
fn weighted(near: i16, far: i16) -> i16 {
    // The result lies between `near` and `far`, so it fits.
    ((3 * i32::from(near) + i32::from(far) + 2) >> 2) as i16
}

#[allow(clippy::cast_possible_truncation)]
fn saturate(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

fn upsample_line(src: &[i16], dst: &mut [i16], kernel: UpscaleKernel) {
    let last = src.len().saturating_sub(1);
    for (x, &sample) in src.iter().enumerate() {
        let (left, right) = match kernel {
            UpscaleKernel::Nearest => (sample, sample),
            UpscaleKernel::Linear => (
                weighted(sample, src[x.saturating_sub(1)]),
                weighted(sample, src[(x + 1).min(last)]),
            ),
        };
        if let Some(out) = dst.get_mut(2 * x) {
            *out = left;
        }
        if let Some(out) = dst.get_mut(2 * x + 1) {
            *out = right;
        }
    }
}

impl PixelBackend for CpuBackend {
    fn name(&self) -> &str {
        if self.parallel {
            "cpu-parallel"
        } else {
            "cpu-scalar"
        }
    }

    fn convert_format(
        &self,
        src: PlaneRef<'_>,
        dst: PlaneMut<'_>,
        _plane: usize,
    ) -> Result<(), KernelError> {
        let (width, height) = (dst.width, dst.height);
        same_size((width, height), (src.width, src.height))?;
        let (src_stride, dst_stride) = (src.row_stride, dst.row_stride);
        let w = width as usize;
        let h = height as usize;
        match (src.samples, dst.samples) {
            (Samples::U8(s), SamplesMut::S16(d)) => {
                check_layout(s.len(), src_stride, width, height)?;
                check_layout(d.len(), dst_stride, width, height)?;
                self.for_each_chunk(d, dst_stride, h, |y, out| {
                    for (o, &i) in out[..w].iter_mut().zip(row(s, src_stride, y, w)) {
                        *o = i16::from(i) << INTERNAL_SHIFT;
                    }
                });
            }
            (Samples::S16(s), SamplesMut::U8(d)) => {
                check_layout(s.len(), src_stride, width, height)?;
                check_layout(d.len(), dst_stride, width, height)?;
                let round = 1 << (INTERNAL_SHIFT - 1);
                self.for_each_chunk(d, dst_stride, h, |y, out| {
                    for (o, &i) in out[..w].iter_mut().zip(row(s, src_stride, y, w)) {
                        let value = ((i32::from(i) + round) >> INTERNAL_SHIFT).clamp(0, 255);
                        *o = u8::try_from(value).unwrap_or(u8::MAX);
                    }
                });
            }
            (Samples::U8(s), SamplesMut::U8(d)) => {
                check_layout(s.len(), src_stride, width, height)?;
                check_layout(d.len(), dst_stride, width, height)?;
                self.for_each_chunk(d, dst_stride, h, |y, out| {
                    out[..w].copy_from_slice(row(s, src_stride, y, w));
                });
            }
            (Samples::S16(s), SamplesMut::S16(d)) => {
                check_layout(s.len(), src_stride, width, height)?;
                check_layout(d.len(), dst_stride, width, height)?;
                self.for_each_chunk(d, dst_stride, h, |y, out| {
                    out[..w].copy_from_slice(row(s, src_stride, y, w));
                });
            }
        }
        Ok(())
    }

    fn upscale(
        &self,
        src: PlaneRef<'_>,
        dst: PlaneMut<'_>,
        base_for_pa: Option<PlaneRef<'_>>,
        kernel: UpscaleKernel,
        mode: ScalingMode,
    ) -> Result<(), KernelError> {
        if mode == ScalingMode::None {
            return Err(KernelError::NoScaling);
        }
        let source_size = mode.downscaled(dst.width, dst.height);
        if source_size != (src.width, src.height) {
            return Err(KernelError::DimensionMismatch {
                expected: mode.upscaled(src.width, src.height),
                actual: (dst.width, dst.height),
            });
        }
        let (Samples::S16(s), SamplesMut::S16(d)) = (src.samples, dst.samples) else {
            return Err(KernelError::UnsupportedFormat("upscale"));
        };
        check_layout(s.len(), src.row_stride, src.width, src.height)?;
        check_layout(d.len(), dst.row_stride, dst.width, dst.height)?;
        let base = match base_for_pa {
            Some(base) => {
                same_size(source_size, (base.width, base.height))?;
                let Samples::S16(b) = base.samples else {
                    return Err(KernelError::UnsupportedFormat("predicted average"));
                };
                check_layout(b.len(), base.row_stride, base.width, base.height)?;
                Some((b, base.row_stride))
            }
            None => None,
        };

        let (sw, sh) = (src.width as usize, src.height as usize);
        let (dw, dh) = (dst.width as usize, dst.height as usize);
        if sw == 0 || sh == 0 {
            return Ok(());
        }
        let dst_stride = dst.row_stride;

        // Horizontal pass at source height.
        let hw = 2 * sw;
        let mut horizontal = vec![0_i16; hw * sh];
        self.for_each_chunk(&mut horizontal, hw, sh, |y, out| {
            upsample_line(row(s, src.row_stride, y, sw), out, kernel);
        });

        match mode {
            ScalingMode::Horizontal => {
                self.for_each_chunk(d, dst_stride, dh, |y, out| {
                    out[..dw].copy_from_slice(&horizontal[y * hw..][..dw]);
                });
            }
            ScalingMode::Both => {
                self.for_each_chunk(d, dst_stride, dh, |y, out| {
                    let sy = y / 2;
                    let near = &horizontal[sy * hw..][..dw];
                    match kernel {
                        UpscaleKernel::Nearest => out[..dw].copy_from_slice(near),
                        UpscaleKernel::Linear => {
                            let fy = if y % 2 == 0 {
                                sy.saturating_sub(1)
                            } else {
                                (sy + 1).min(sh - 1)
                            };
                            let far = &horizontal[fy * hw..][..dw];
                            for ((o, &n), &f) in out[..dw].iter_mut().zip(near).zip(far) {
                                *o = weighted(n, f);
                            }
                        }
                    }
                });
            }
            ScalingMode::None => {}
        }

        if let Some((b, base_stride)) = base {
            let (bx, by) = match mode {
                ScalingMode::Horizontal => (2, 1),
                _ => (2, 2),
            };
            // Each chunk holds the `by` destination rows of one source row.
            self.for_each_chunk(d, dst_stride * by, sh, |sy, block_rows| {
                for sx in 0..sw {
                    let mut sum = 0_i32;
                    let mut count = 0_i32;
                    let mut positions = [0_usize; 4];
                    for ry in 0..by {
                        for rx in 0..bx {
                            let x = sx * bx + rx;
                            let pos = ry * dst_stride + x;
                            if x < dw && sy * by + ry < dh && pos < block_rows.len() {
                                sum += i32::from(block_rows[pos]);
                                positions[count as usize] = pos;
                                count += 1;
                            }
                        }
                    }
                    if count == 0 {
                        continue;
                    }
                    let delta = i32::from(b[sy * base_stride + sx]) - sum.div_euclid(count);
                    for &pos in &positions[..count as usize] {
                        block_rows[pos] = saturate(i32::from(block_rows[pos]) + delta);
                    }
                }
            });
        }
        Ok(())
    }

    fn apply_command_buffer(
        &self,
        target: PlaneMut<'_>,
        commands: &CommandBuffer,
        options: ApplyOptions,
    ) -> Result<(), KernelError> {
        let SamplesMut::S16(d) = target.samples else {
            return Err(KernelError::UnsupportedFormat("apply_command_buffer"));
        };
        check_layout(d.len(), target.row_stride, target.width, target.height)?;
        let ApplyOptions { tile, highlight } = options;
        let tile_end = (tile.x + tile.width, tile.y + tile.height);
        if tile_end.0 > target.width || tile_end.1 > target.height {
            return Err(KernelError::DimensionMismatch {
                expected: (target.width, target.height),
                actual: tile_end,
            });
        }
        if let Some(outside) = commands
            .commands
            .iter()
            .find(|c| u32::from(c.x) >= tile.width || u32::from(c.y) >= tile.height)
        {
            return Err(KernelError::OutOfTile {
                x: outside.x,
                y: outside.y,
            });
        }
        for command in &commands.commands {
            let y = (tile.y + u32::from(command.y)) as usize;
            let x = (tile.x + u32::from(command.x)) as usize;
            let sample = &mut d[y * target.row_stride + x];
            *sample = match (highlight, command.op) {
                (true, _) => HIGHLIGHT,
                (false, ResidualOp::Add) => sample.saturating_add(command.value),
                (false, ResidualOp::Set) => command.value,
            };
        }
        Ok(())
    }

    fn add_planes(&self, addend: PlaneRef<'_>, dst: PlaneMut<'_>) -> Result<(), KernelError> {
        same_size((dst.width, dst.height), (addend.width, addend.height))?;
        let (Samples::S16(a), SamplesMut::S16(d)) = (addend.samples, dst.samples) else {
            return Err(KernelError::UnsupportedFormat("add_planes"));
        };
        check_layout(a.len(), addend.row_stride, addend.width, addend.height)?;
        check_layout(d.len(), dst.row_stride, dst.width, dst.height)?;
        let w = dst.width as usize;
        self.for_each_chunk(d, dst.row_stride, dst.height as usize, |y, out| {
            for (o, &i) in out[..w].iter_mut().zip(row(a, addend.row_stride, y, w)) {
                *o = o.saturating_add(i);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        enhancement::{ResidualCommand, TileRect},
        picture::PlaneBuf,
    };

    fn plane_from(width: u32, height: u32, values: &[i16]) -> PlaneBuf<i16> {
        let mut plane = PlaneBuf::new(width, height);
        for (idx, &value) in values.iter().enumerate() {
            let idx = u32::try_from(idx).unwrap();
            plane.set(idx % width, idx / width, value);
        }
        plane
    }

    fn rows(plane: &PlaneBuf<i16>) -> Vec<Vec<i16>> {
        (0..plane.height()).map(|y| plane.row(y).to_vec()).collect()
    }

    #[test]
    fn conversion_round_trips_picture_samples() {
        let backend = CpuBackend::scalar();
        let mut picture = PlaneBuf::<u8>::new(3, 2);
        for (x, y, v) in [(0, 0, 0), (1, 0, 17), (2, 1, 255)] {
            picture.set(x, y, v);
        }
        let mut internal = PlaneBuf::<i16>::new(3, 2);
        backend
            .convert_format(picture.plane_ref(), internal.plane_mut(), 0)
            .unwrap();
        assert_eq!(internal.get(1, 0), Some(17 << INTERNAL_SHIFT));

        let mut back = PlaneBuf::<u8>::new(3, 2);
        backend
            .convert_format(internal.plane_ref(), back.plane_mut(), 0)
            .unwrap();
        assert_eq!(back, picture);
    }

    #[test]
    fn conversion_rejects_size_mismatch() {
        let backend = CpuBackend::scalar();
        let src = PlaneBuf::<u8>::new(4, 4);
        let mut dst = PlaneBuf::<u8>::new(4, 3);
        assert_eq!(
            backend.convert_format(src.plane_ref(), dst.plane_mut(), 0),
            Err(KernelError::DimensionMismatch {
                expected: (4, 3),
                actual: (4, 4)
            })
        );
    }

    #[test]
    fn nearest_upscale_replicates_samples() {
        let backend = CpuBackend::scalar();
        let src = plane_from(2, 1, &[10, 20]);
        let mut dst = PlaneBuf::<i16>::new(4, 2);
        backend
            .upscale(
                src.plane_ref(),
                dst.plane_mut(),
                None,
                UpscaleKernel::Nearest,
                ScalingMode::Both,
            )
            .unwrap();
        assert_eq!(rows(&dst), vec![vec![10, 10, 20, 20], vec![10, 10, 20, 20]]);
    }

    #[test]
    fn linear_upscale_interpolates_and_clamps_edges() {
        let backend = CpuBackend::scalar();
        let src = plane_from(2, 1, &[0, 400]);
        let mut dst = PlaneBuf::<i16>::new(4, 1);
        backend
            .upscale(
                src.plane_ref(),
                dst.plane_mut(),
                None,
                UpscaleKernel::Linear,
                ScalingMode::Horizontal,
            )
            .unwrap();
        assert_eq!(rows(&dst), vec![vec![0, 100, 300, 400]]);
    }

    #[test]
    fn predicted_average_restores_block_means() {
        let backend = CpuBackend::scalar();
        let src = plane_from(3, 1, &[0, 400, 0]);
        let mut dst = PlaneBuf::<i16>::new(6, 1);
        backend
            .upscale(
                src.plane_ref(),
                dst.plane_mut(),
                Some(src.plane_ref()),
                UpscaleKernel::Linear,
                ScalingMode::Horizontal,
            )
            .unwrap();
        let out = dst.row(0);
        for (x, &expected) in [0_i32, 400, 0].iter().enumerate() {
            let sum = i32::from(out[2 * x]) + i32::from(out[2 * x + 1]);
            assert_eq!(sum.div_euclid(2), expected, "block {x}: {out:?}");
        }
    }

    #[test]
    fn upscale_accepts_odd_destination() {
        let backend = CpuBackend::scalar();
        let src = plane_from(2, 2, &[1, 2, 3, 4]);
        let mut dst = PlaneBuf::<i16>::new(3, 3);
        backend
            .upscale(
                src.plane_ref(),
                dst.plane_mut(),
                None,
                UpscaleKernel::Nearest,
                ScalingMode::Both,
            )
            .unwrap();
        assert_eq!(rows(&dst), vec![vec![1, 1, 2], vec![1, 1, 2], vec![3, 3, 4]]);
    }

    #[test]
    fn residuals_outside_tile_apply_nothing() {
        let backend = CpuBackend::scalar();
        let mut target = PlaneBuf::<i16>::new(4, 4);
        let commands = CommandBuffer {
            commands: vec![ResidualCommand::add(0, 0, 5), ResidualCommand::add(0, 2, 5)],
        };
        let options = ApplyOptions {
            tile: TileRect {
                x: 0,
                y: 2,
                width: 4,
                height: 2,
            },
            highlight: false,
        };
        assert_eq!(
            backend.apply_command_buffer(target.plane_mut(), &commands, options),
            Err(KernelError::OutOfTile { x: 0, y: 2 })
        );
        assert!(rows(&target).iter().flatten().all(|&v| v == 0));

        let commands = CommandBuffer {
            commands: vec![ResidualCommand::add(1, 1, 5), ResidualCommand::set(3, 0, -7)],
        };
        backend
            .apply_command_buffer(target.plane_mut(), &commands, options)
            .unwrap();
        assert_eq!(target.get(1, 3), Some(5));
        assert_eq!(target.get(3, 2), Some(-7));
    }

    #[test]
    fn highlight_overrides_residual_values() {
        let backend = CpuBackend::scalar();
        let mut target = PlaneBuf::<i16>::new(2, 2);
        let commands = CommandBuffer {
            commands: vec![ResidualCommand::add(1, 1, 1)],
        };
        let options = ApplyOptions {
            tile: TileRect {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
            },
            highlight: true,
        };
        backend
            .apply_command_buffer(target.plane_mut(), &commands, options)
            .unwrap();
        assert_eq!(target.get(1, 1), Some(HIGHLIGHT));
    }

    #[test]
    fn add_planes_saturates() {
        let backend = CpuBackend::scalar();
        let addend = plane_from(2, 1, &[i16::MAX, -3]);
        let mut dst = plane_from(2, 1, &[10, 5]);
        backend.add_planes(addend.plane_ref(), dst.plane_mut()).unwrap();
        assert_eq!(rows(&dst), vec![vec![i16::MAX, 2]]);
    }

    #[test]
    fn parallel_matches_scalar() {
        let (width, height) = (48, 96);
        let values: Vec<i16> = (0..width * height)
            .map(|v| i16::try_from(v % 509).unwrap() * 13 - 3000)
            .collect();
        let src = plane_from(width, height, &values);
        let run = |backend: CpuBackend| {
            let mut dst = PlaneBuf::<i16>::new(width * 2, height * 2);
            backend
                .upscale(
                    src.plane_ref(),
                    dst.plane_mut(),
                    Some(src.plane_ref()),
                    UpscaleKernel::Linear,
                    ScalingMode::Both,
                )
                .unwrap();
            backend.add_planes(dst.clone().plane_ref(), dst.plane_mut()).unwrap();
            dst
        };
        assert_eq!(run(CpuBackend::scalar()), run(CpuBackend::parallel()));
    }
}
