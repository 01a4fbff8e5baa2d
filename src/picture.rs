use crate::types::MAX_PLANES;
use core::fmt;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Pixel layout of a picture. All formats carry 8-bit samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorFormat {
    /// Luma only.
    Gray8,
    /// Planar YUV with chroma subsampled both ways.
    #[default]
    I420,
    /// Planar YUV with chroma subsampled horizontally.
    I422,
    /// Planar YUV without subsampling.
    I444,
}

impl ColorFormat {
    /// Number of planes a picture of this format carries.
    #[must_use]
    pub const fn num_planes(self) -> usize {
        match self {
            Self::Gray8 => 1,
            Self::I420 | Self::I422 | Self::I444 => 3,
        }
    }

    /// Bits per sample.
    #[must_use]
    pub const fn bit_depth(self) -> u8 {
        8
    }

    /// Horizontal subsampling shift of `plane`.
    #[must_use]
    pub const fn plane_width_shift(self, plane: usize) -> u32 {
        match (self, plane) {
            (Self::I420 | Self::I422, 1 | 2) => 1,
            _ => 0,
        }
    }

    /// Vertical subsampling shift of `plane`.
    #[must_use]
    pub const fn plane_height_shift(self, plane: usize) -> u32 {
        match (self, plane) {
            (Self::I420, 1 | 2) => 1,
            _ => 0,
        }
    }
}

/// Format and luma dimensions of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PictureDesc {
    /// Plane layout.
    pub format: ColorFormat,
    /// Width of plane 0 in samples.
    pub width: u32,
    /// Height of plane 0 in samples.
    pub height: u32,
}

impl PictureDesc {
    /// Describe a picture of `format` with `width` x `height` luma samples.
    #[must_use]
    pub const fn new(format: ColorFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    /// Dimensions of `plane`, rounding subsampled sizes up.
    #[must_use]
    pub const fn plane_size(&self, plane: usize) -> (u32, u32) {
        let ws = self.format.plane_width_shift(plane);
        let hs = self.format.plane_height_shift(plane);
        (
            (self.width + (1 << ws) - 1) >> ws,
            (self.height + (1 << hs) - 1) >> hs,
        )
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for i16 {}
}

/// Sample types a [`PlaneBuf`] may hold: `u8` for pictures, `i16` fixed point
/// for internal buffers.
pub trait Sample: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    /// Wrap a sample slice into the type-tagged form handed to kernels.
    fn samples(data: &[Self]) -> Samples<'_>;
    /// Mutable counterpart of [`Sample::samples`].
    fn samples_mut(data: &mut [Self]) -> SamplesMut<'_>;
}

impl Sample for u8 {
    fn samples(data: &[Self]) -> Samples<'_> {
        Samples::U8(data)
    }

    fn samples_mut(data: &mut [Self]) -> SamplesMut<'_> {
        SamplesMut::U8(data)
    }
}

impl Sample for i16 {
    fn samples(data: &[Self]) -> Samples<'_> {
        Samples::S16(data)
    }

    fn samples_mut(data: &mut [Self]) -> SamplesMut<'_> {
        SamplesMut::S16(data)
    }
}

/// Borrowed sample storage of a plane.
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    /// 8-bit unsigned samples.
    U8(&'a [u8]),
    /// 16-bit signed fixed-point samples.
    S16(&'a [i16]),
}

/// Mutably borrowed sample storage of a plane.
#[derive(Debug)]
pub enum SamplesMut<'a> {
    /// 8-bit unsigned samples.
    U8(&'a mut [u8]),
    /// 16-bit signed fixed-point samples.
    S16(&'a mut [i16]),
}

/// Read-only plane descriptor handed to kernels.
#[derive(Debug, Clone, Copy)]
pub struct PlaneRef<'a> {
    /// Row-major samples, `row_stride` apart.
    pub samples: Samples<'a>,
    /// Distance in samples between the starts of two rows.
    pub row_stride: usize,
    /// Visible width in samples.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
}

/// Writable plane descriptor handed to kernels.
#[derive(Debug)]
pub struct PlaneMut<'a> {
    /// Row-major samples, `row_stride` apart.
    pub samples: SamplesMut<'a>,
    /// Distance in samples between the starts of two rows.
    pub row_stride: usize,
    /// Visible width in samples.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
}

/// Owned, row-major plane of samples.
#[derive(Clone, PartialEq, Eq)]
pub struct PlaneBuf<T> {
    data: Vec<T>,
    stride: usize,
    width: u32,
    height: u32,
}

impl<T> fmt::Debug for PlaneBuf<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlaneBuf({}x{})", self.width, self.height)
    }
}

impl<T: Sample> PlaneBuf<T> {
    /// Zero-filled plane of `width` x `height` samples.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize;
        Self {
            data: vec![T::default(); stride * height as usize],
            stride,
            width,
            height,
        }
    }

    /// Width in samples.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in rows.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the plane has exactly these dimensions.
    #[must_use]
    pub fn has_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Reallocate to `width` x `height` if the size differs. Returns whether
    /// a reallocation happened; a reallocated plane is zeroed.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if self.has_size(width, height) {
            return false;
        }
        *self = Self::new(width, height);
        true
    }

    /// Set every sample to `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Sample at (`x`, `y`), if inside the plane.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y as usize * self.stride + x as usize).copied()
    }

    /// Overwrite the sample at (`x`, `y`). Out-of-range writes are ignored.
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        if x < self.width && y < self.height {
            self.data[y as usize * self.stride + x as usize] = value;
        }
    }

    /// Visible samples of row `y`.
    #[must_use]
    pub fn row(&self, y: u32) -> &[T] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize]
    }

    /// Plane descriptor for reading.
    #[must_use]
    pub fn plane_ref(&self) -> PlaneRef<'_> {
        PlaneRef {
            samples: T::samples(&self.data),
            row_stride: self.stride,
            width: self.width,
            height: self.height,
        }
    }

    /// Plane descriptor for writing.
    pub fn plane_mut(&mut self) -> PlaneMut<'_> {
        PlaneMut {
            samples: T::samples_mut(&mut self.data),
            row_stride: self.stride,
            width: self.width,
            height: self.height,
        }
    }
}

/// Internal plane shared between the tasks of one frame.
pub(crate) type SharedPlane = Arc<Mutex<PlaneBuf<i16>>>;

pub(crate) fn shared_plane(width: u32, height: u32) -> SharedPlane {
    Arc::new(Mutex::new(PlaneBuf::new(width, height)))
}

static NEXT_PICTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Reference-counted picture with independently locked planes.
///
/// Clones refer to the same picture; equality is identity. Tasks working on
/// different planes of one picture lock different planes and run in
/// parallel.
#[derive(Clone)]
pub struct Picture {
    inner: Arc<PictureInner>,
}

struct PictureInner {
    id: u64,
    desc: Mutex<PictureDesc>,
    planes: [Mutex<PlaneBuf<u8>>; MAX_PLANES],
}

impl Picture {
    /// Allocate a zeroed picture.
    #[must_use]
    pub fn new(desc: PictureDesc) -> Self {
        let planes = core::array::from_fn(|plane| {
            let buf = if plane < desc.format.num_planes() {
                let (width, height) = desc.plane_size(plane);
                PlaneBuf::new(width, height)
            } else {
                PlaneBuf::new(0, 0)
            };
            Mutex::new(buf)
        });
        Self {
            inner: Arc::new(PictureInner {
                id: NEXT_PICTURE_ID.fetch_add(1, Ordering::Relaxed),
                desc: Mutex::new(desc),
                planes,
            }),
        }
    }

    /// Process-unique identity of this picture.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current layout.
    #[must_use]
    pub fn desc(&self) -> PictureDesc {
        *self.inner.desc.lock()
    }

    /// Change the layout, reallocating planes whose size changes.
    pub fn set_desc(&self, desc: PictureDesc) {
        let mut current = self.inner.desc.lock();
        for (plane, buf) in self.inner.planes.iter().enumerate() {
            let (width, height) = if plane < desc.format.num_planes() {
                desc.plane_size(plane)
            } else {
                (0, 0)
            };
            buf.lock().resize(width, height);
        }
        *current = desc;
    }

    /// Lock `plane` for reading or writing.
    ///
    /// Returns `None` when the format has no such plane.
    pub fn plane(&self, plane: usize) -> Option<MutexGuard<'_, PlaneBuf<u8>>> {
        if plane >= self.desc().format.num_planes() {
            return None;
        }
        self.inner.planes.get(plane).map(|buf| buf.lock())
    }

    /// Set every sample of `plane` to `value`.
    pub fn fill(&self, plane: usize, value: u8) {
        if let Some(mut buf) = self.plane(plane) {
            buf.fill(value);
        }
    }

    /// Read one sample.
    #[must_use]
    pub fn sample(&self, plane: usize, x: u32, y: u32) -> Option<u8> {
        self.plane(plane)?.get(x, y)
    }
}

impl PartialEq for Picture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Picture {}

impl fmt::Debug for Picture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self.desc();
        write!(
            f,
            "Picture(#{} {:?} {}x{})",
            self.inner.id, desc.format, desc.width, desc.height
        )
    }
}
