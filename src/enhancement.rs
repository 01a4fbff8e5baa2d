//! Per-frame enhancement configuration.
//!
//! Enhancement packets use a compact little-endian layout:
//!
//! ```text
//! u8 flags            GLOBAL | IDR | TEMPORAL_REFRESH | LOQ1 | LOQ0
//! [global block]      present when GLOBAL is set
//!   u16 width, u16 height, u8 chroma, u8 num_planes,
//!   u8 scaling_loq1, u8 scaling_loq0, u8 kernel, u8 tools, u8 num_tiles
//! residuals           for each enabled LOQ (LOQ1 first), enhanced plane and tile:
//!   u16 count, count x { u16 x, u16 y, i16 value, u8 op }
//! ```
//!
//! A packet without a global block reuses the last one seen by the
//! [`ConfigPool`].

use crate::{
    picture::{ColorFormat, PictureDesc},
    types::{Loq, Timestamp},
};
use bytes::{Buf, BufMut, Bytes};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Global block follows the flags byte.
pub const FLAG_GLOBAL: u8 = 0x01;
/// Instantaneous decoder refresh: temporal state restarts from zero.
pub const FLAG_IDR: u8 = 0x02;
/// Temporal buffers are cleared before this frame's residuals apply.
pub const FLAG_TEMPORAL_REFRESH: u8 = 0x04;
/// Residuals are present for LOQ1.
pub const FLAG_LOQ1: u8 = 0x08;
/// Residuals are present for LOQ0.
pub const FLAG_LOQ0: u8 = 0x10;

const TOOL_TEMPORAL: u8 = 0x01;
const TOOL_PREDICTED_AVERAGE: u8 = 0x02;
const MAX_TILES: u8 = 16;
const COMMAND_SIZE: usize = 7;

/// Error produced while parsing enhancement data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Packet ended before a field could be read.
    #[error("enhancement data truncated: needed {needed} more bytes, {remaining} left")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes left in the packet.
        remaining: usize,
    },
    /// Packet relies on a global configuration that was never received.
    #[error("no global configuration received yet")]
    MissingGlobalConfig,
    /// A field holds a value outside its range.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Raw value read.
        value: u32,
    },
    /// Bytes left over after the last residual block.
    #[error("{0} trailing bytes after enhancement data")]
    TrailingBytes(usize),
}

/// Upscale applied when moving to the next level of quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScalingMode {
    /// Same resolution; the two levels share one buffer.
    #[default]
    None,
    /// Width doubles.
    Horizontal,
    /// Width and height double.
    Both,
}

impl ScalingMode {
    fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Horizontal),
            2 => Ok(Self::Both),
            value => Err(ParseError::InvalidField {
                field: "scaling mode",
                value: value.into(),
            }),
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Horizontal => 1,
            Self::Both => 2,
        }
    }

    /// Size of the upscaled plane for a source of `width` x `height`.
    #[must_use]
    pub const fn upscaled(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::None => (width, height),
            Self::Horizontal => (width * 2, height),
            Self::Both => (width * 2, height * 2),
        }
    }

    /// Size of the source plane that upscales to `width` x `height`.
    #[must_use]
    pub const fn downscaled(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::None => (width, height),
            Self::Horizontal => (width.div_ceil(2), height),
            Self::Both => (width.div_ceil(2), height.div_ceil(2)),
        }
    }
}

/// Interpolation used by upscaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpscaleKernel {
    /// Sample replication.
    #[default]
    Nearest,
    /// 3:1 weighted interpolation between neighbours.
    Linear,
}

/// Stream-level configuration shared by consecutive frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Output (LOQ0) luma width.
    pub width: u32,
    /// Output (LOQ0) luma height.
    pub height: u32,
    /// Plane layout of base and output pictures.
    pub format: ColorFormat,
    /// Number of planes that carry residuals, starting at plane 0.
    pub num_planes: usize,
    /// Upscale into LOQ0 (from LOQ1), then into LOQ1 (from LOQ2).
    pub scaling_modes: [ScalingMode; 2],
    /// Upscale interpolation.
    pub kernel: UpscaleKernel,
    /// Whether LOQ0 residuals accumulate in temporal buffers.
    pub temporal_enabled: bool,
    /// Whether upscaling preserves the average of each source sample.
    pub predicted_average: bool,
    /// Number of horizontal residual bands per plane.
    pub num_tiles: usize,
}

impl GlobalConfig {
    /// Configuration with no scaling, one enhanced plane and one tile.
    #[must_use]
    pub fn new(width: u32, height: u32, format: ColorFormat) -> Self {
        Self {
            width,
            height,
            format,
            num_planes: 1,
            scaling_modes: [ScalingMode::None; 2],
            kernel: UpscaleKernel::Nearest,
            temporal_enabled: false,
            predicted_average: false,
            num_tiles: 1,
        }
    }

    /// Layout of the output picture.
    #[must_use]
    pub fn output_desc(&self) -> PictureDesc {
        PictureDesc::new(self.format, self.width, self.height)
    }

    /// Layout the base picture is expected to have.
    #[must_use]
    pub fn base_desc(&self) -> PictureDesc {
        let (width, height) = self.loq_size(Loq::Loq2, 0);
        PictureDesc::new(self.format, width, height)
    }

    /// Scaling applied when entering `loq` from the level below. LOQ2 has
    /// none.
    #[must_use]
    pub fn scaling_into(&self, loq: Loq) -> ScalingMode {
        match loq {
            Loq::Loq0 => self.scaling_modes[0],
            Loq::Loq1 => self.scaling_modes[1],
            Loq::Loq2 => ScalingMode::None,
        }
    }

    /// Dimensions of `plane` at `loq`.
    #[must_use]
    pub fn loq_size(&self, loq: Loq, plane: usize) -> (u32, u32) {
        let (width, height) = self.output_desc().plane_size(plane);
        let (width, height) = match loq {
            Loq::Loq0 => return (width, height),
            _ => self.scaling_modes[0].downscaled(width, height),
        };
        match loq {
            Loq::Loq1 => (width, height),
            _ => self.scaling_modes[1].downscaled(width, height),
        }
    }

    /// Whether `loq` needs its own buffer, as opposed to sharing the buffer
    /// of the level above because no scaling separates them.
    #[must_use]
    pub fn has_own_buffer(&self, loq: Loq) -> bool {
        match loq {
            Loq::Loq0 => true,
            Loq::Loq1 => self.scaling_modes[0] != ScalingMode::None,
            Loq::Loq2 => self.scaling_modes[1] != ScalingMode::None,
        }
    }

    /// Rows covered by `tile` of `plane` at `loq`.
    #[must_use]
    pub fn tile_rect(&self, loq: Loq, plane: usize, tile: usize) -> TileRect {
        let (width, height) = self.loq_size(loq, plane);
        let tiles = self.num_tiles.max(1) as u64;
        let tile = tile as u64;
        let band = |t: u64| u32::try_from(u64::from(height) * t / tiles).unwrap_or(height);
        let y = band(tile);
        TileRect {
            x: 0,
            y,
            width,
            height: band(tile + 1) - y,
        }
    }

    fn parse(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let width = u32::from(take_u16(buf)?);
        let height = u32::from(take_u16(buf)?);
        if width == 0 || height == 0 {
            return Err(ParseError::InvalidField {
                field: "dimensions",
                value: width.min(height),
            });
        }
        let format = match take_u8(buf)? {
            0 => ColorFormat::Gray8,
            1 => ColorFormat::I420,
            2 => ColorFormat::I422,
            3 => ColorFormat::I444,
            value => {
                return Err(ParseError::InvalidField {
                    field: "chroma",
                    value: value.into(),
                });
            }
        };
        let num_planes = take_u8(buf)?;
        if num_planes == 0 || usize::from(num_planes) > format.num_planes() {
            return Err(ParseError::InvalidField {
                field: "plane count",
                value: num_planes.into(),
            });
        }
        let scaling_loq1 = ScalingMode::from_code(take_u8(buf)?)?;
        let scaling_loq0 = ScalingMode::from_code(take_u8(buf)?)?;
        let kernel = match take_u8(buf)? {
            0 => UpscaleKernel::Nearest,
            1 => UpscaleKernel::Linear,
            value => {
                return Err(ParseError::InvalidField {
                    field: "kernel",
                    value: value.into(),
                });
            }
        };
        let tools = take_u8(buf)?;
        let num_tiles = take_u8(buf)?;
        if num_tiles == 0 || num_tiles > MAX_TILES {
            return Err(ParseError::InvalidField {
                field: "tile count",
                value: num_tiles.into(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            num_planes: num_planes.into(),
            scaling_modes: [scaling_loq0, scaling_loq1],
            kernel,
            temporal_enabled: tools & TOOL_TEMPORAL != 0,
            predicted_average: tools & TOOL_PREDICTED_AVERAGE != 0,
            num_tiles: num_tiles.into(),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        let format = match self.format {
            ColorFormat::Gray8 => 0,
            ColorFormat::I420 => 1,
            ColorFormat::I422 => 2,
            ColorFormat::I444 => 3,
        };
        let mut tools = 0;
        if self.temporal_enabled {
            tools |= TOOL_TEMPORAL;
        }
        if self.predicted_average {
            tools |= TOOL_PREDICTED_AVERAGE;
        }
        out.put_u16_le(u16::try_from(self.width).unwrap_or(u16::MAX));
        out.put_u16_le(u16::try_from(self.height).unwrap_or(u16::MAX));
        out.put_u8(format);
        out.put_u8(u8::try_from(self.num_planes).unwrap_or(u8::MAX));
        out.put_u8(self.scaling_modes[1].code());
        out.put_u8(self.scaling_modes[0].code());
        out.put_u8(match self.kernel {
            UpscaleKernel::Nearest => 0,
            UpscaleKernel::Linear => 1,
        });
        out.put_u8(tools);
        out.put_u8(u8::try_from(self.num_tiles).unwrap_or(u8::MAX));
    }
}

/// Region of a plane covered by one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRect {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width in samples.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
}

/// Configuration of a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameConfig {
    /// Frame restarts temporal prediction.
    pub idr: bool,
    /// Temporal buffers are cleared before use.
    pub temporal_refresh: bool,
    /// Residuals present, indexed by LOQ (`[LOQ0, LOQ1]`).
    pub loq_enabled: [bool; 2],
    /// Raw residual payloads indexed `[loq][plane][tile]`.
    residuals: [Vec<Vec<Bytes>>; 2],
}

impl FrameConfig {
    /// Configuration of a frame that applies no residuals.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Whether temporal buffers must start from zero.
    #[must_use]
    pub fn temporal_clear(&self) -> bool {
        self.idr || self.temporal_refresh
    }

    /// Whether any residuals are applied.
    #[must_use]
    pub fn has_residuals(&self) -> bool {
        self.loq_enabled.iter().any(|&enabled| enabled)
    }

    /// Whether residuals are present for `loq`.
    #[must_use]
    pub fn loq_enabled(&self, loq: Loq) -> bool {
        match loq {
            Loq::Loq0 => self.loq_enabled[0],
            Loq::Loq1 => self.loq_enabled[1],
            Loq::Loq2 => false,
        }
    }

    /// Raw residual payload of one tile.
    #[must_use]
    pub fn tile_payload(&self, loq: Loq, plane: usize, tile: usize) -> Option<&Bytes> {
        self.residuals
            .get(loq.index())?
            .get(plane)?
            .get(tile)
    }

    fn parse(
        flags: u8,
        global: &GlobalConfig,
        buf: &mut &[u8],
        data: &Bytes,
    ) -> Result<Self, ParseError> {
        let mut config = Self {
            idr: flags & FLAG_IDR != 0,
            temporal_refresh: flags & FLAG_TEMPORAL_REFRESH != 0,
            loq_enabled: [flags & FLAG_LOQ0 != 0, flags & FLAG_LOQ1 != 0],
            residuals: [Vec::new(), Vec::new()],
        };
        for loq in [Loq::Loq1, Loq::Loq0] {
            if !config.loq_enabled(loq) {
                continue;
            }
            let mut planes = Vec::with_capacity(global.num_planes);
            for _ in 0..global.num_planes {
                let mut tiles = Vec::with_capacity(global.num_tiles);
                for _ in 0..global.num_tiles {
                    let count = usize::from(take_u16(buf)?);
                    let len = count * COMMAND_SIZE;
                    ensure(buf, len)?;
                    let start = data.len() - buf.remaining();
                    tiles.push(data.slice(start..start + len));
                    buf.advance(len);
                }
                planes.push(tiles);
            }
            config.residuals[loq.index()] = planes;
        }
        Ok(config)
    }
}

/// How a residual modifies its sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualOp {
    /// Add to the current value.
    Add,
    /// Replace the current value.
    Set,
}

/// One residual of a tile, relative to the tile origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidualCommand {
    /// Column within the tile.
    pub x: u16,
    /// Row within the tile.
    pub y: u16,
    /// Residual in internal fixed-point units.
    pub value: i16,
    /// How the residual is applied.
    pub op: ResidualOp,
}

impl ResidualCommand {
    /// Residual that adds `value` at (`x`, `y`).
    #[must_use]
    pub const fn add(x: u16, y: u16, value: i16) -> Self {
        Self {
            x,
            y,
            value,
            op: ResidualOp::Add,
        }
    }

    /// Residual that sets (`x`, `y`) to `value`.
    #[must_use]
    pub const fn set(x: u16, y: u16, value: i16) -> Self {
        Self {
            x,
            y,
            value,
            op: ResidualOp::Set,
        }
    }
}

/// Decoded residuals of one tile, ready for a backend to apply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandBuffer {
    /// Residuals in payload order.
    pub commands: Vec<ResidualCommand>,
}

impl CommandBuffer {
    /// Decode a raw tile payload.
    ///
    /// # Errors
    /// If the payload is not a whole number of commands or an op code is
    /// unknown.
    pub fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() % COMMAND_SIZE != 0 {
            return Err(ParseError::TrailingBytes(payload.len() % COMMAND_SIZE));
        }
        let mut buf = payload;
        let mut commands = Vec::with_capacity(payload.len() / COMMAND_SIZE);
        while buf.has_remaining() {
            let x = buf.get_u16_le();
            let y = buf.get_u16_le();
            let value = buf.get_i16_le();
            let op = match buf.get_u8() {
                0 => ResidualOp::Add,
                1 => ResidualOp::Set,
                value => {
                    return Err(ParseError::InvalidField {
                        field: "residual op",
                        value: value.into(),
                    });
                }
            };
            commands.push(ResidualCommand { x, y, value, op });
        }
        Ok(Self { commands })
    }

    /// Whether there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Parsed configuration state carried across frames.
///
/// Remembers the most recent global configuration so frames that omit it can
/// still be decoded.
#[derive(Debug, Default)]
pub struct ConfigPool {
    global: Option<Arc<GlobalConfig>>,
}

impl ConfigPool {
    /// Empty pool: the first packet must carry a global block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent global configuration, if any.
    #[must_use]
    pub fn global(&self) -> Option<&Arc<GlobalConfig>> {
        self.global.as_ref()
    }

    /// Parse the enhancement data of the frame at `timestamp`.
    ///
    /// A global block in `data` replaces the pool's global configuration only
    /// if the whole packet parses.
    ///
    /// # Errors
    /// If the packet is malformed or needs a global configuration the pool
    /// does not have.
    pub fn insert(
        &mut self,
        timestamp: Timestamp,
        data: &Bytes,
    ) -> Result<(Arc<GlobalConfig>, FrameConfig), ParseError> {
        let mut buf: &[u8] = data;
        let flags = take_u8(&mut buf)?;
        let global = if flags & FLAG_GLOBAL != 0 {
            let parsed = GlobalConfig::parse(&mut buf)?;
            match &self.global {
                Some(current) if **current == parsed => current.clone(),
                _ => Arc::new(parsed),
            }
        } else {
            self.global.clone().ok_or(ParseError::MissingGlobalConfig)?
        };
        let config = FrameConfig::parse(flags, &global, &mut buf, data)?;
        if buf.has_remaining() {
            return Err(ParseError::TrailingBytes(buf.remaining()));
        }
        trace!(
            timestamp,
            idr = config.idr,
            loq0 = config.loq_enabled[0],
            loq1 = config.loq_enabled[1],
            "parsed enhancement config"
        );
        self.global = Some(global.clone());
        Ok((global, config))
    }

    /// Configuration for a pass-through frame: the current global
    /// configuration (if any) and a frame configuration without residuals.
    #[must_use]
    pub fn passthrough(&self) -> (Option<Arc<GlobalConfig>>, FrameConfig) {
        (self.global.clone(), FrameConfig::passthrough())
    }
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), ParseError> {
    if buf.remaining() < needed {
        return Err(ParseError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ParseError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, ParseError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

/// Assembles enhancement packets in the layout this crate parses.
///
/// Useful for feeding the pipeline from tools and tests.
#[derive(Debug, Clone, Default)]
pub struct PacketBuilder {
    flags: u8,
    global: Option<GlobalConfig>,
    num_planes: usize,
    num_tiles: usize,
    residuals: Vec<(Loq, usize, usize, Vec<ResidualCommand>)>,
}

impl PacketBuilder {
    /// Packet without global block or residuals, laid out for one plane and
    /// one tile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_planes: 1,
            num_tiles: 1,
            ..Self::default()
        }
    }

    /// Include a global block; also fixes the residual layout.
    #[must_use]
    pub fn global(mut self, global: GlobalConfig) -> Self {
        self.flags |= FLAG_GLOBAL;
        self.num_planes = global.num_planes;
        self.num_tiles = global.num_tiles;
        self.global = Some(global);
        self
    }

    /// Residual layout for packets that rely on an earlier global block.
    #[must_use]
    pub fn layout(mut self, num_planes: usize, num_tiles: usize) -> Self {
        self.num_planes = num_planes;
        self.num_tiles = num_tiles;
        self
    }

    /// Mark the frame as an IDR.
    #[must_use]
    pub fn idr(mut self) -> Self {
        self.flags |= FLAG_IDR;
        self
    }

    /// Mark the frame as refreshing temporal state.
    #[must_use]
    pub fn temporal_refresh(mut self) -> Self {
        self.flags |= FLAG_TEMPORAL_REFRESH;
        self
    }

    /// Enable `loq` with no residuals in any tile.
    #[must_use]
    pub fn enable(mut self, loq: Loq) -> Self {
        self.flags |= match loq {
            Loq::Loq0 => FLAG_LOQ0,
            Loq::Loq1 => FLAG_LOQ1,
            Loq::Loq2 => 0,
        };
        self
    }

    /// Add residuals to one tile, enabling its LOQ.
    #[must_use]
    pub fn residuals(
        self,
        loq: Loq,
        plane: usize,
        tile: usize,
        commands: impl IntoIterator<Item = ResidualCommand>,
    ) -> Self {
        let mut builder = self.enable(loq);
        builder
            .residuals
            .push((loq, plane, tile, commands.into_iter().collect()));
        builder
    }

    /// Serialize the packet.
    #[must_use]
    pub fn build(&self) -> Bytes {
        let mut out = Vec::new();
        out.put_u8(self.flags);
        if let Some(global) = &self.global {
            global.write(&mut out);
        }
        for (loq, flag) in [(Loq::Loq1, FLAG_LOQ1), (Loq::Loq0, FLAG_LOQ0)] {
            if self.flags & flag == 0 {
                continue;
            }
            for plane in 0..self.num_planes {
                for tile in 0..self.num_tiles {
                    let commands: Vec<_> = self
                        .residuals
                        .iter()
                        .filter(|(l, p, t, _)| *l == loq && *p == plane && *t == tile)
                        .flat_map(|(_, _, _, commands)| commands.iter().copied())
                        .collect();
                    out.put_u16_le(u16::try_from(commands.len()).unwrap_or(u16::MAX));
                    for command in commands {
                        out.put_u16_le(command.x);
                        out.put_u16_le(command.y);
                        out.put_i16_le(command.value);
                        out.put_u8(match command.op {
                            ResidualOp::Add => 0,
                            ResidualOp::Set => 1,
                        });
                    }
                }
            }
        }
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalConfig {
        GlobalConfig {
            num_tiles: 2,
            scaling_modes: [ScalingMode::Both, ScalingMode::Horizontal],
            ..GlobalConfig::new(16, 8, ColorFormat::I420)
        }
    }

    #[test]
    fn loq_sizes_follow_scaling_modes() {
        let global = global();
        assert_eq!(global.loq_size(Loq::Loq0, 0), (16, 8));
        assert_eq!(global.loq_size(Loq::Loq1, 0), (8, 4));
        assert_eq!(global.loq_size(Loq::Loq2, 0), (4, 4));
        assert_eq!(global.loq_size(Loq::Loq2, 1), (2, 2));
        assert_eq!(global.base_desc(), PictureDesc::new(ColorFormat::I420, 4, 4));
        assert!(global.has_own_buffer(Loq::Loq1));
        assert!(global.has_own_buffer(Loq::Loq2));
    }

    #[test]
    fn tiles_split_rows_into_bands() {
        let global = global();
        assert_eq!(global.tile_rect(Loq::Loq0, 0, 0), TileRect { x: 0, y: 0, width: 16, height: 4 });
        assert_eq!(global.tile_rect(Loq::Loq0, 0, 1), TileRect { x: 0, y: 4, width: 16, height: 4 });
    }

    #[test]
    fn packet_without_global_reuses_previous() {
        let mut pool = ConfigPool::new();
        let first = PacketBuilder::new()
            .global(GlobalConfig::new(8, 8, ColorFormat::Gray8))
            .idr()
            .residuals(Loq::Loq0, 0, 0, [ResidualCommand::add(1, 2, 128)])
            .build();
        let (global, config) = pool.insert(1, &first).unwrap();
        assert!(config.idr);
        assert!(config.loq_enabled(Loq::Loq0));
        let payload = config.tile_payload(Loq::Loq0, 0, 0).unwrap();
        assert_eq!(
            CommandBuffer::decode(payload).unwrap().commands,
            vec![ResidualCommand::add(1, 2, 128)]
        );

        let second = PacketBuilder::new().enable(Loq::Loq0).build();
        let (reused, config) = pool.insert(2, &second).unwrap();
        assert!(Arc::ptr_eq(&global, &reused));
        assert!(!config.idr);
        assert!(CommandBuffer::decode(config.tile_payload(Loq::Loq0, 0, 0).unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let mut pool = ConfigPool::new();
        assert_eq!(
            pool.insert(1, &PacketBuilder::new().build()).unwrap_err(),
            ParseError::MissingGlobalConfig
        );

        let mut truncated = PacketBuilder::new()
            .global(GlobalConfig::new(8, 8, ColorFormat::Gray8))
            .enable(Loq::Loq0)
            .build()
            .to_vec();
        truncated.pop();
        assert!(matches!(
            pool.insert(2, &Bytes::from(truncated)),
            Err(ParseError::Truncated { .. })
        ));
        // A failed packet leaves the pool untouched.
        assert!(pool.global().is_none());

        let bad_chroma = Bytes::from_static(&[FLAG_GLOBAL, 8, 0, 8, 0, 9, 1, 0, 0, 0, 0, 1]);
        assert_eq!(
            pool.insert(3, &bad_chroma).unwrap_err(),
            ParseError::InvalidField {
                field: "chroma",
                value: 9
            }
        );
    }
}
