//! Mono8 pixel operations for motion analysis.
//!
//! All functions operate on the luma plane only and are stride-aware: an
//! image may carry padding bytes past `width` on each row, which every loop
//! here skips. Panics if the backing buffer is smaller than
//! `stride * height` or if `stride < width`.

use machine_vision_formats::{
    pixel_format::Mono8, ImageBuffer, ImageBufferMutRef, ImageBufferRef, ImageData, ImageMutData,
    ImageStride, Stride,
};

mod components;
mod letterbox;

pub use components::{component_boxes, ComponentBox};
pub use letterbox::letterbox_luma_to_3ch;

/// Owned Mono8 image backed by a `Vec<u8>`.
#[derive(Clone, PartialEq)]
pub struct LumaImage {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

impl LumaImage {
    /// Wrap a buffer. Returns `None` if the buffer cannot hold
    /// `stride * (height - 1) + width` bytes.
    pub fn new(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Option<Self> {
        if stride < width {
            return None;
        }
        let need = stride as usize * (height as usize).saturating_sub(1) + width as usize;
        if data.len() < need {
            return None;
        }
        Some(LumaImage {
            width,
            height,
            stride,
            data,
        })
    }

    /// Allocate a zero-filled image with `stride == width`.
    pub fn zeros(width: u32, height: u32) -> Self {
        LumaImage {
            width,
            height,
            stride: width,
            data: vec![0u8; width as usize * height as usize],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.stride as usize + x as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, val: u8) {
        self.data[y as usize * self.stride as usize + x as usize] = val;
    }
}

impl std::fmt::Debug for LumaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "LumaImage {{ {}x{} }}", self.width, self.height)
    }
}

impl ImageData<Mono8> for LumaImage {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn buffer_ref(&self) -> ImageBufferRef<'_, Mono8> {
        ImageBufferRef::new(&self.data)
    }
    fn buffer(self) -> ImageBuffer<Mono8> {
        ImageBuffer::new(self.data)
    }
}

impl ImageMutData<Mono8> for LumaImage {
    fn buffer_mut_ref(&mut self) -> ImageBufferMutRef<'_, Mono8> {
        ImageBufferMutRef::new(&mut self.data)
    }
}

impl Stride for LumaImage {
    fn stride(&self) -> usize {
        self.stride as usize
    }
}

impl From<LumaImage> for Vec<u8> {
    fn from(orig: LumaImage) -> Vec<u8> {
        orig.data
    }
}

#[inline]
fn rows<IM: ImageStride<Mono8>>(im: &IM) -> impl Iterator<Item = &[u8]> + '_ {
    let datalen = im.height() as usize * im.stride();
    let width = im.width() as usize;
    im.image_data()[..datalen]
        .chunks_exact(im.stride())
        .map(move |row| &row[..width])
}

/// Nearest-neighbor resize.
pub fn resize_nearest<IM>(im: &IM, out_width: u32, out_height: u32) -> LumaImage
where
    IM: ImageStride<Mono8>,
{
    let mut out = LumaImage::zeros(out_width, out_height);
    let sx = im.width() as f32 / out_width as f32;
    let sy = im.height() as f32 / out_height as f32;
    let src = im.image_data();
    let src_stride = im.stride();
    for oy in 0..out_height {
        let iy = ((oy as f32 + 0.5) * sy) as usize;
        let iy = iy.min(im.height() as usize - 1);
        for ox in 0..out_width {
            let ix = ((ox as f32 + 0.5) * sx) as usize;
            let ix = ix.min(im.width() as usize - 1);
            out.data[oy as usize * out_width as usize + ox as usize] =
                src[iy * src_stride + ix];
        }
    }
    out
}

/// 3x3 Gaussian blur, kernel `[1 2 1; 2 4 2; 1 2 1] / 16`, edge rows and
/// columns replicated.
pub fn gaussian_blur_3x3<IM>(im: &IM) -> LumaImage
where
    IM: ImageStride<Mono8>,
{
    let (w, h) = (im.width() as i64, im.height() as i64);
    let src = im.image_data();
    let stride = im.stride();
    let at = |x: i64, y: i64| -> u32 {
        let x = x.clamp(0, w - 1) as usize;
        let y = y.clamp(0, h - 1) as usize;
        src[y * stride + x] as u32
    };
    let mut out = LumaImage::zeros(im.width(), im.height());
    for y in 0..h {
        for x in 0..w {
            let acc = at(x - 1, y - 1)
                + 2 * at(x, y - 1)
                + at(x + 1, y - 1)
                + 2 * at(x - 1, y)
                + 4 * at(x, y)
                + 2 * at(x + 1, y)
                + at(x - 1, y + 1)
                + 2 * at(x, y + 1)
                + at(x + 1, y + 1);
            out.data[y as usize * w as usize + x as usize] = ((acc + 8) / 16) as u8;
        }
    }
    out
}

/// Histogram equalization over the full image.
pub fn equalize_hist<IM>(mut im: IM) -> IM
where
    IM: ImageStride<Mono8> + ImageMutData<Mono8>,
{
    let width = im.width() as usize;
    let height = im.height() as usize;
    let stride = im.stride();
    let npixels = (width * height) as u64;
    if npixels == 0 {
        return im;
    }

    let mut hist = [0u64; 256];
    {
        let data = &im.buffer_mut_ref().data[..];
        for row in data[..height * stride].chunks_exact(stride) {
            for v in &row[..width] {
                hist[*v as usize] += 1;
            }
        }
    }

    // cumulative distribution, remapped so the lowest occupied bin maps to 0
    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|c| *c > 0).unwrap_or(0);
    let denom = npixels.saturating_sub(cdf_min);

    let mut lut = [0u8; 256];
    for i in 0..256 {
        lut[i] = if denom == 0 {
            i as u8
        } else {
            ((cdf[i].saturating_sub(cdf_min)) * 255 / denom) as u8
        };
    }

    let data = &mut im.buffer_mut_ref().data[..height * stride];
    for row in data.chunks_exact_mut(stride) {
        for v in row[..width].iter_mut() {
            *v = lut[*v as usize];
        }
    }
    im
}

/// Per-pixel absolute difference. Panics if dimensions differ.
pub fn absdiff<A, B>(a: &A, b: &B) -> LumaImage
where
    A: ImageStride<Mono8>,
    B: ImageStride<Mono8>,
{
    assert_eq!(a.width(), b.width());
    assert_eq!(a.height(), b.height());
    let mut out = LumaImage::zeros(a.width(), a.height());
    let width = a.width() as usize;
    for (orow, (arow, brow)) in out
        .data
        .chunks_exact_mut(width)
        .zip(rows(a).zip(rows(b)))
    {
        for ((o, av), bv) in orow.iter_mut().zip(arow).zip(brow) {
            *o = av.abs_diff(*bv);
        }
    }
    out
}

/// Binary threshold: pixels strictly greater than `thresh` become 255,
/// everything else 0.
pub fn threshold_binary<IM>(mut im: IM, thresh: u8) -> IM
where
    IM: ImageStride<Mono8> + ImageMutData<Mono8>,
{
    let width = im.width() as usize;
    let height = im.height() as usize;
    let stride = im.stride();
    let data = &mut im.buffer_mut_ref().data[..height * stride];
    for row in data.chunks_exact_mut(stride) {
        for v in row[..width].iter_mut() {
            *v = if *v > thresh { 255 } else { 0 };
        }
    }
    im
}

/// One pass of 3x3 dilation on a binary image: a pixel becomes 255 if any
/// neighbor in its 3x3 window is nonzero.
pub fn dilate_3x3<IM>(im: &IM) -> LumaImage
where
    IM: ImageStride<Mono8>,
{
    let (w, h) = (im.width() as i64, im.height() as i64);
    let src = im.image_data();
    let stride = im.stride();
    let mut out = LumaImage::zeros(im.width(), im.height());
    for y in 0..h {
        for x in 0..w {
            let mut hit = false;
            'win: for dy in -1..=1 {
                for dx in -1..=1 {
                    let nx = x + dx;
                    let ny = y + dy;
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    if src[ny as usize * stride + nx as usize] != 0 {
                        hit = true;
                        break 'win;
                    }
                }
            }
            if hit {
                out.data[y as usize * w as usize + x as usize] = 255;
            }
        }
    }
    out
}

/// Accumulate `im` into the f32 running average `avg` with weight `alpha`:
/// `avg = (1 - alpha) * avg + alpha * im`. Panics if lengths mismatch.
pub fn accumulate_weighted<IM>(im: &IM, avg: &mut [f32], alpha: f32)
where
    IM: ImageStride<Mono8>,
{
    let width = im.width() as usize;
    assert_eq!(avg.len(), width * im.height() as usize);
    for (arow, irow) in avg.chunks_exact_mut(width).zip(rows(im)) {
        for (a, v) in arow.iter_mut().zip(irow) {
            *a = (1.0 - alpha) * *a + alpha * *v as f32;
        }
    }
}

/// Render an f32 accumulator as a Mono8 image (round to nearest, saturate).
pub fn accumulator_as_luma(avg: &[f32], width: u32, height: u32) -> LumaImage {
    assert_eq!(avg.len(), width as usize * height as usize);
    let data = avg
        .iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    LumaImage {
        width,
        height,
        stride: width,
        data,
    }
}
