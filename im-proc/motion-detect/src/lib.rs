//! Adaptive background-subtraction motion detection.
//!
//! The detector keeps an f32 running-average background of a downscaled luma
//! plane and reports bounding rectangles of sufficiently large difference
//! components, scaled back to source resolution. Masked areas are saturated
//! before differencing so they can never produce motion.

use machine_vision_formats::{pixel_format::Mono8, ImageStride};
use serde::{Deserialize, Serialize};
use tracing::debug;

use frame_ops::{
    absdiff, accumulate_weighted, accumulator_as_luma, component_boxes, dilate_3x3,
    equalize_hist, gaussian_blur_3x3, resize_nearest, threshold_binary, LumaImage,
};
use kestrel_types::{PixelRect, Polygon};

/// Consecutive motion frames required before the background starts absorbing
/// the moving content.
const MOTION_PERSIST_FRAMES: u32 = 10;

/// Tuning for one camera's motion detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Height of the downscaled analysis plane; width follows the aspect.
    pub frame_height: u32,
    /// Minimum luma delta counted as change.
    pub threshold: u8,
    /// Minimum component pixel area (at analysis scale) counted as motion.
    pub contour_area: u32,
    /// Background accumulation weight.
    pub frame_alpha: f32,
    pub improve_contrast: bool,
    /// Mask polygons in source-resolution coordinates.
    pub mask: Vec<Polygon>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        MotionSettings {
            frame_height: 100,
            threshold: 30,
            contour_area: 10,
            frame_alpha: 0.01,
            improve_contrast: false,
            mask: Vec::new(),
        }
    }
}

pub struct MotionDetector {
    settings: MotionSettings,
    /// Source detect resolution.
    src_width: u32,
    src_height: u32,
    /// Analysis resolution.
    motion_width: u32,
    motion_height: u32,
    resize_factor: f64,
    avg_frame: Vec<f32>,
    /// Indices (at analysis scale) saturated by the camera mask.
    mask_indices: Vec<usize>,
    motion_frame_count: u32,
    seeded: bool,
}

impl std::fmt::Debug for MotionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionDetector")
            .field("src", &(self.src_width, self.src_height))
            .field("motion", &(self.motion_width, self.motion_height))
            .field("motion_frame_count", &self.motion_frame_count)
            .finish_non_exhaustive()
    }
}

impl MotionDetector {
    pub fn new(src_width: u32, src_height: u32, settings: MotionSettings) -> MotionDetector {
        assert!(settings.frame_height > 0);
        let motion_height = settings.frame_height.min(src_height);
        let motion_width =
            ((src_width as u64 * motion_height as u64) / src_height as u64).max(1) as u32;
        let resize_factor = src_height as f64 / motion_height as f64;

        // rasterize the mask polygons once, at analysis scale
        let mut mask_indices = Vec::new();
        if !settings.mask.is_empty() {
            for my in 0..motion_height {
                for mx in 0..motion_width {
                    let sx = (mx as f64 + 0.5) * resize_factor;
                    let sy = (my as f64 + 0.5) * resize_factor;
                    if settings.mask.iter().any(|p| p.contains(sx, sy)) {
                        mask_indices.push((my * motion_width + mx) as usize);
                    }
                }
            }
        }

        MotionDetector {
            settings,
            src_width,
            src_height,
            motion_width,
            motion_height,
            resize_factor,
            avg_frame: vec![0.0; motion_width as usize * motion_height as usize],
            mask_indices,
            motion_frame_count: 0,
            seeded: false,
        }
    }

    /// Analyze one luma frame; returns motion rectangles at source
    /// resolution. The first frame seeds the background and reports no
    /// motion.
    pub fn detect<IM>(&mut self, frame: &IM) -> Vec<PixelRect>
    where
        IM: ImageStride<Mono8>,
    {
        debug_assert_eq!(frame.width(), self.src_width);
        debug_assert_eq!(frame.height(), self.src_height);

        let resized = resize_nearest(frame, self.motion_width, self.motion_height);
        let blurred = gaussian_blur_3x3(&resized);
        let mut current = if self.settings.improve_contrast {
            equalize_hist(blurred)
        } else {
            blurred
        };
        self.apply_mask(&mut current);

        if !self.seeded {
            self.seeded = true;
            accumulate_weighted(&current, &mut self.avg_frame, 1.0);
            debug!("background seeded from first frame");
            return Vec::new();
        }

        let background = accumulator_as_luma(
            &self.avg_frame,
            self.motion_width,
            self.motion_height,
        );
        let delta = absdiff(&current, &background);
        let thresh = threshold_binary(delta, self.settings.threshold);
        let dilated = dilate_3x3(&thresh);

        let motion_boxes: Vec<PixelRect> = component_boxes(&dilated, self.settings.contour_area)
            .into_iter()
            .map(|c| {
                PixelRect::new(
                    (c.x1 as f64 * self.resize_factor) as i64,
                    (c.y1 as f64 * self.resize_factor) as i64,
                    (c.x2 as f64 * self.resize_factor) as i64,
                    (c.y2 as f64 * self.resize_factor) as i64,
                )
                .clamp_to(self.src_width, self.src_height)
            })
            .collect();

        if motion_boxes.is_empty() {
            // no motion: keep converging toward the empty scene
            accumulate_weighted(&current, &mut self.avg_frame, self.settings.frame_alpha);
            self.motion_frame_count = 0;
        } else {
            self.motion_frame_count += 1;
            if self.motion_frame_count >= MOTION_PERSIST_FRAMES {
                // only absorb the difference once it has persisted a while
                accumulate_weighted(&current, &mut self.avg_frame, self.settings.frame_alpha);
            }
        }

        motion_boxes
    }

    fn apply_mask(&self, im: &mut LumaImage) {
        for &idx in &self.mask_indices {
            let x = (idx as u32) % self.motion_width;
            let y = (idx as u32) / self.motion_width;
            im.set_pixel(x, y, 255);
        }
    }

    pub fn motion_size(&self) -> (u32, u32) {
        (self.motion_width, self.motion_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(width: u32, height: u32, value: u8) -> LumaImage {
        LumaImage::new(width, height, width, vec![value; (width * height) as usize]).unwrap()
    }

    fn frame_with_block(
        width: u32,
        height: u32,
        bg: u8,
        fg: u8,
        rect: (u32, u32, u32, u32),
    ) -> LumaImage {
        let mut im = flat_frame(width, height, bg);
        let (x1, y1, x2, y2) = rect;
        for y in y1..y2 {
            for x in x1..x2 {
                im.set_pixel(x, y, fg);
            }
        }
        im
    }

    fn settings() -> MotionSettings {
        MotionSettings {
            frame_height: 60,
            threshold: 30,
            contour_area: 5,
            frame_alpha: 0.1,
            improve_contrast: false,
            mask: Vec::new(),
        }
    }

    #[test]
    fn test_static_scene_quiet_within_30_frames() {
        let mut det = MotionDetector::new(320, 240, settings());
        let frame = frame_with_block(320, 240, 40, 200, (50, 50, 120, 120));
        let mut quiet_from = None;
        for i in 0..30 {
            let boxes = det.detect(&frame);
            if boxes.is_empty() && quiet_from.is_none() {
                quiet_from = Some(i);
            }
            if !boxes.is_empty() {
                quiet_from = None;
            }
        }
        let quiet_from = quiet_from.expect("motion never settled");
        assert!(quiet_from < 30);
        // and it stays quiet
        assert!(det.detect(&frame).is_empty());
    }

    #[test]
    fn test_appearing_block_reports_motion_box() {
        let mut det = MotionDetector::new(320, 240, settings());
        let empty = flat_frame(320, 240, 40);
        det.detect(&empty); // seed
        det.detect(&empty);

        let with_block = frame_with_block(320, 240, 40, 220, (80, 60, 160, 140));
        let boxes = det.detect(&with_block);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        // at source resolution, with some tolerance for downscale + dilate
        assert!(b.x1 >= 60 && b.x1 <= 90, "x1 = {}", b.x1);
        assert!(b.y1 >= 40 && b.y1 <= 70, "y1 = {}", b.y1);
        assert!(b.x2 >= 150 && b.x2 <= 180, "x2 = {}", b.x2);
        assert!(b.y2 >= 130 && b.y2 <= 160, "y2 = {}", b.y2);
    }

    #[test]
    fn test_masked_area_never_reports_motion() {
        let mut s = settings();
        s.mask = vec![Polygon::new(vec![
            (0.0, 0.0),
            (320.0, 0.0),
            (320.0, 240.0),
            (0.0, 240.0),
        ])
        .unwrap()];
        let mut det = MotionDetector::new(320, 240, s);
        let empty = flat_frame(320, 240, 40);
        det.detect(&empty);
        let with_block = frame_with_block(320, 240, 40, 220, (80, 60, 160, 140));
        assert!(det.detect(&with_block).is_empty());
    }

    #[test]
    fn test_persistent_change_absorbed_into_background() {
        let mut det = MotionDetector::new(320, 240, settings());
        let empty = flat_frame(320, 240, 40);
        det.detect(&empty);

        // a parked object: motion at first, absorbed after persistence + alpha
        let parked = frame_with_block(320, 240, 40, 220, (80, 60, 160, 140));
        let mut last_len = usize::MAX;
        for _ in 0..120 {
            last_len = det.detect(&parked).len();
        }
        assert_eq!(last_len, 0, "parked object was never absorbed");
    }

    #[test]
    fn test_small_components_filtered() {
        let mut s = settings();
        s.contour_area = 50;
        let mut det = MotionDetector::new(320, 240, s);
        let empty = flat_frame(320, 240, 40);
        det.detect(&empty);
        // a 8x8 source block is ~2x2 at analysis scale: below contour_area
        let tiny = frame_with_block(320, 240, 40, 220, (100, 100, 108, 108));
        assert!(det.detect(&tiny).is_empty());
    }
}
