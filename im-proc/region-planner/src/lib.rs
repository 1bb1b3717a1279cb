//! Region selection for detection.
//!
//! Each frame the planner chooses a small set of square sub-regions to run
//! inference over: one per active tracked object (centered on its predicted
//! box) and one per uncovered motion cluster, with sizes drawn from a
//! quantized ladder. A persistent per-camera grid remembers which parts of
//! the frame historically produced detections and biases future sizing
//! there.

use machine_vision_formats::{pixel_format::Mono8, ImageStride};

use frame_ops::letterbox_luma_to_3ch;
use kestrel_types::{PixelRect, SquareRegion};

/// Regions whose IoU exceeds this are merged before submission.
const MERGE_IOU: f64 = 0.5;

/// Growth factor applied to an object's box when sizing its region.
const OBJECT_REGION_GROWTH: f64 = 1.2;

/// Ladder step ratio; region sides are `min_region * LADDER_STEP^k`.
const LADDER_STEP: f64 = 1.5;

/// EWMA weight for grid updates.
const GRID_ALPHA: f64 = 0.1;

/// Grid bucket EWMA above which motion regions get one extra ladder step.
const GRID_PRODUCTIVE: f64 = 0.3;

const GRID_COLS: usize = 8;
const GRID_ROWS: usize = 8;

#[derive(Debug, Clone)]
pub struct RegionSettings {
    /// Minimum region side, normally the model input side.
    pub min_region: i64,
    /// Upper bound on regions submitted per frame.
    pub max_regions: usize,
}

impl Default for RegionSettings {
    fn default() -> Self {
        RegionSettings {
            min_region: 320,
            max_regions: 3,
        }
    }
}

pub struct RegionPlanner {
    width: u32,
    height: u32,
    settings: RegionSettings,
    /// EWMA of detection productivity per coarse frame bucket.
    grid: [f64; GRID_COLS * GRID_ROWS],
}

impl std::fmt::Debug for RegionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionPlanner")
            .field("frame", &(self.width, self.height))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RegionPlanner {
    pub fn new(width: u32, height: u32, settings: RegionSettings) -> RegionPlanner {
        RegionPlanner {
            width,
            height,
            settings,
            grid: [0.0; GRID_COLS * GRID_ROWS],
        }
    }

    /// Choose regions for this frame.
    ///
    /// `tracked_boxes` are velocity-predicted boxes of active (non-stationary)
    /// tracked objects; `motion_boxes` come from the motion detector. At most
    /// `max_regions` regions are returned, tracked objects first.
    pub fn plan(
        &mut self,
        tracked_boxes: &[PixelRect],
        motion_boxes: &[PixelRect],
    ) -> Vec<SquareRegion> {
        let mut regions: Vec<SquareRegion> = Vec::new();

        for rect in tracked_boxes {
            let side = ((rect.width().max(rect.height()) as f64 * OBJECT_REGION_GROWTH) as i64)
                .max(self.settings.min_region);
            let (cx, cy) = rect.centroid();
            regions.push(SquareRegion::centered(cx, cy, side, self.width, self.height));
        }

        for cluster in cluster_boxes(motion_boxes) {
            if regions.iter().any(|r| r.contains_rect(&cluster)) {
                continue;
            }
            let (cx, cy) = cluster.centroid();
            let mut side = self.ladder_side(cluster.width().max(cluster.height()));
            if self.bucket_ewma(cx, cy) > GRID_PRODUCTIVE {
                // historically productive area: take one more ladder step of
                // context
                side = self.ladder_side(side + 1);
            }
            regions.push(SquareRegion::centered(cx, cy, side, self.width, self.height));
        }

        let merged = merge_regions(regions, self.width, self.height);
        if merged.len() > self.settings.max_regions {
            tracing::debug!(
                "dropping {} candidate regions beyond the per-frame cap",
                merged.len() - self.settings.max_regions
            );
        }
        merged
            .into_iter()
            .take(self.settings.max_regions)
            .collect()
    }

    /// Record where confirmed detections landed so future sizing favors
    /// those buckets. Buckets decay toward zero when nothing lands.
    pub fn note_detections(&mut self, detection_rects: &[PixelRect]) {
        let mut hit = [false; GRID_COLS * GRID_ROWS];
        for rect in detection_rects {
            let (cx, cy) = rect.centroid();
            hit[self.bucket_index(cx, cy)] = true;
        }
        for (ewma, hit) in self.grid.iter_mut().zip(hit) {
            let target = if hit { 1.0 } else { 0.0 };
            *ewma = (1.0 - GRID_ALPHA) * *ewma + GRID_ALPHA * target;
        }
    }

    /// Smallest ladder side >= the needed extent, capped at the frame.
    fn ladder_side(&self, extent: i64) -> i64 {
        let cap = (self.width.min(self.height)) as i64;
        let needed = ((extent as f64) * OBJECT_REGION_GROWTH) as i64;
        let mut side = self.settings.min_region;
        while side < needed && side < cap {
            side = ((side as f64) * LADDER_STEP) as i64;
        }
        side.min(cap)
    }

    fn bucket_index(&self, x: i64, y: i64) -> usize {
        let col = ((x.max(0) as u64 * GRID_COLS as u64) / self.width.max(1) as u64)
            .min(GRID_COLS as u64 - 1) as usize;
        let row = ((y.max(0) as u64 * GRID_ROWS as u64) / self.height.max(1) as u64)
            .min(GRID_ROWS as u64 - 1) as usize;
        row * GRID_COLS + col
    }

    fn bucket_ewma(&self, x: i64, y: i64) -> f64 {
        self.grid[self.bucket_index(x, y)]
    }
}

/// Merge overlapping motion boxes into covering clusters.
fn cluster_boxes(boxes: &[PixelRect]) -> Vec<PixelRect> {
    let mut clusters: Vec<PixelRect> = Vec::new();
    for rect in boxes {
        let mut rect = *rect;
        loop {
            match clusters.iter().position(|c| c.intersection(&rect) > 0) {
                Some(i) => {
                    let c = clusters.swap_remove(i);
                    rect = PixelRect::new(
                        rect.x1.min(c.x1),
                        rect.y1.min(c.y1),
                        rect.x2.max(c.x2),
                        rect.y2.max(c.y2),
                    );
                }
                None => {
                    clusters.push(rect);
                    break;
                }
            }
        }
    }
    clusters
}

/// Merge regions whose IoU exceeds [`MERGE_IOU`] into one covering region.
fn merge_regions(mut regions: Vec<SquareRegion>, width: u32, height: u32) -> Vec<SquareRegion> {
    loop {
        let mut merged_any = false;
        'outer: for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                if regions[i].iou(&regions[j]) > MERGE_IOU {
                    let a = regions[i].as_rect();
                    let b = regions[j].as_rect();
                    let cover = PixelRect::new(
                        a.x1.min(b.x1),
                        a.y1.min(b.y1),
                        a.x2.max(b.x2),
                        a.y2.max(b.y2),
                    );
                    let (cx, cy) = cover.centroid();
                    let side = cover.width().max(cover.height());
                    let replacement = SquareRegion::centered(cx, cy, side, width, height);
                    regions.swap_remove(j);
                    regions[i] = replacement;
                    merged_any = true;
                    break 'outer;
                }
            }
        }
        if !merged_any {
            return regions;
        }
    }
}

/// Letterbox a region crop into the model input tensor (`side*side*3` u8).
pub fn render_region<IM>(frame: &IM, region: &SquareRegion, model_side: usize, out: &mut [u8])
where
    IM: ImageStride<Mono8>,
{
    let crop = (
        region.x.max(0) as u32,
        region.y.max(0) as u32,
        region.side as u32,
        region.side as u32,
    );
    letterbox_luma_to_3ch(frame, crop, model_side, out);
}
