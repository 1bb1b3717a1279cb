use machine_vision_formats::{pixel_format::Mono8, ImageStride};

/// Gray used for letterbox padding, matching common detector preprocessing.
pub const LETTERBOX_FILL: u8 = 114;

/// Resize a luma crop into a square `side`x`side`x3 HWC u8 tensor, preserving
/// aspect ratio and padding with [`LETTERBOX_FILL`]. The luma value is
/// replicated across the three channels.
///
/// `out` must be exactly `side * side * 3` bytes. The crop window
/// `(cx, cy, cw, ch)` is clamped to the source image.
pub fn letterbox_luma_to_3ch<IM>(
    im: &IM,
    (cx, cy, cw, ch): (u32, u32, u32, u32),
    side: usize,
    out: &mut [u8],
) where
    IM: ImageStride<Mono8>,
{
    assert_eq!(out.len(), side * side * 3);
    out.fill(LETTERBOX_FILL);

    let cx = cx.min(im.width().saturating_sub(1)) as usize;
    let cy = cy.min(im.height().saturating_sub(1)) as usize;
    let cw = (cw as usize).min(im.width() as usize - cx);
    let ch = (ch as usize).min(im.height() as usize - cy);
    if cw == 0 || ch == 0 {
        return;
    }

    let scale = side as f32 / cw.max(ch) as f32;
    let dw = ((cw as f32 * scale) as usize).clamp(1, side);
    let dh = ((ch as f32 * scale) as usize).clamp(1, side);
    let ox = (side - dw) / 2;
    let oy = (side - dh) / 2;

    let src = im.image_data();
    let stride = im.stride();
    for dy in 0..dh {
        let sy = cy + (dy * ch) / dh;
        let orow = &mut out[((oy + dy) * side + ox) * 3..((oy + dy) * side + ox + dw) * 3];
        for dx in 0..dw {
            let sx = cx + (dx * cw) / dw;
            let v = src[sy * stride + sx];
            orow[dx * 3] = v;
            orow[dx * 3 + 1] = v;
            orow[dx * 3 + 2] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LumaImage;

    #[test]
    fn test_square_crop_fills_output() {
        let mut im = LumaImage::zeros(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                im.set_pixel(x, y, 200);
            }
        }
        let mut out = vec![0u8; 4 * 4 * 3];
        letterbox_luma_to_3ch(&im, (0, 0, 8, 8), 4, &mut out);
        assert!(out.iter().all(|v| *v == 200));
    }

    #[test]
    fn test_wide_crop_pads_top_and_bottom() {
        let mut im = LumaImage::zeros(8, 4);
        for y in 0..4 {
            for x in 0..8 {
                im.set_pixel(x, y, 50);
            }
        }
        let mut out = vec![0u8; 4 * 4 * 3];
        // 8x4 crop into 4x4: content occupies rows 1..3, rows 0 and 3 padded
        letterbox_luma_to_3ch(&im, (0, 0, 8, 4), 4, &mut out);
        assert!(out[..4 * 3].iter().all(|v| *v == LETTERBOX_FILL));
        assert!(out[4 * 3..8 * 3].iter().all(|v| *v == 50));
        assert!(out[12 * 3..].iter().all(|v| *v == LETTERBOX_FILL));
    }

    #[test]
    fn test_channels_replicated() {
        let mut im = LumaImage::zeros(2, 2);
        im.set_pixel(0, 0, 10);
        im.set_pixel(1, 0, 20);
        im.set_pixel(0, 1, 30);
        im.set_pixel(1, 1, 40);
        let mut out = vec![0u8; 2 * 2 * 3];
        letterbox_luma_to_3ch(&im, (0, 0, 2, 2), 2, &mut out);
        assert_eq!(&out[0..3], &[10, 10, 10]);
        assert_eq!(&out[3..6], &[20, 20, 20]);
        assert_eq!(&out[6..9], &[30, 30, 30]);
        assert_eq!(&out[9..12], &[40, 40, 40]);
    }
}
