//! Per-camera processing worker.
//!
//! Consumes published frames, runs motion detection and region planning,
//! submits at most one detection request at a time to the shared pool, maps
//! results back to frame coordinates and feeds the tracker. Tracker deltas
//! and motion marks go to the supervisor's event loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use machine_vision_formats::{
    pixel_format::Mono8, ImageBuffer, ImageBufferRef, ImageData, Stride,
};
use tracing::{debug, warn};

use accel_detect::{DetectError, DetectionOutcome, DetectorPool};
use frame_arena::{DetectionInputSlot, FrameReceiver, FrameRef};
use kestrel_track::{ObjectTracker, TrackerDelta};
use kestrel_types::{
    CamName, DetectionRow, FpsCounter, ObjectDetection, PixelRect, SquareRegion, UnixTime,
};
use motion_detect::MotionDetector;
use region_planner::{render_region, RegionPlanner};

use crate::stats::CameraMetrics;

/// What the pipeline reports to the supervisor's event loop.
#[derive(Debug)]
pub enum PipelineEvent {
    Delta {
        camera: CamName,
        at: UnixTime,
        delta: TrackerDelta,
    },
    /// Motion was present in this frame (for segment classification).
    Motion { camera: CamName, at: UnixTime },
}

pub struct PipelineContext {
    pub camera: CamName,
    pub width: u32,
    pub height: u32,
    pub model_input_side: u32,
    pub detect_timeout: Duration,
    pub labels: Arc<BTreeMap<u32, String>>,
}

/// Borrowed Mono8 view of the luma plane of a published YUV frame.
struct LumaView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> LumaView<'a> {
    fn of_frame(frame: &'a FrameRef, width: u32, height: u32) -> LumaView<'a> {
        let luma_len = width as usize * height as usize;
        LumaView {
            data: &frame.data()[..luma_len],
            width,
            height,
        }
    }
}

impl ImageData<Mono8> for LumaView<'_> {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn buffer_ref(&self) -> ImageBufferRef<'_, Mono8> {
        ImageBufferRef::new(self.data)
    }
    fn buffer(self) -> ImageBuffer<Mono8> {
        ImageBuffer::new(self.data.to_vec())
    }
}

impl Stride for LumaView<'_> {
    fn stride(&self) -> usize {
        self.width as usize
    }
}

/// Map normalized result rows back to frame pixel coordinates.
pub fn rows_to_detections(
    rows: &[DetectionRow],
    region: SquareRegion,
    labels: &BTreeMap<u32, String>,
) -> Vec<ObjectDetection> {
    let side = region.side as f64;
    rows.iter()
        .map(|row| ObjectDetection {
            label: labels
                .get(&row.class_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            score: row.score,
            rect: PixelRect::new(
                region.x + (row.x1 as f64 * side) as i64,
                region.y + (row.y1 as f64 * side) as i64,
                region.x + (row.x2 as f64 * side) as i64,
                region.y + (row.y2 as f64 * side) as i64,
            ),
            region,
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn run_camera_pipeline(
    ctx: PipelineContext,
    frames: FrameReceiver,
    mut motion: MotionDetector,
    mut planner: RegionPlanner,
    mut tracker: ObjectTracker,
    mut input_slot: DetectionInputSlot,
    pool: Arc<DetectorPool>,
    events_tx: tokio::sync::mpsc::UnboundedSender<PipelineEvent>,
    metrics: Arc<CameraMetrics>,
    stop: Arc<AtomicBool>,
) {
    let mut process_fps = FpsCounter::default();
    let mut detection_fps = FpsCounter::default();
    // a timed-out request that may still be in flight; at most one request
    // per camera is ever outstanding
    let mut pending: Option<Receiver<Result<DetectionOutcome, DetectError>>> = None;

    while !stop.load(Ordering::Relaxed) {
        let frame = match frames.recv_timeout(Duration::from_millis(500)) {
            Ok(frame) => frame,
            Err(frame_arena::Error::AcquireTimeout) => continue,
            Err(_) => break, // arena gone
        };
        let at = frame.timestamp();
        let sequence = frame.sequence();

        let luma = LumaView::of_frame(&frame, ctx.width, ctx.height);
        let motion_boxes = motion.detect(&luma);
        if !motion_boxes.is_empty() {
            let _ = events_tx.send(PipelineEvent::Motion {
                camera: ctx.camera.clone(),
                at,
            });
        }

        let tracked_boxes = tracker.active_boxes();
        let regions = planner.plan(&tracked_boxes, &motion_boxes);

        // an earlier timed-out request may still be running; no new request
        // is issued until its slot is truly free again
        if let Some(stale) = pending.take() {
            match stale.try_recv() {
                // a late result is stale by now and gets discarded
                Ok(_) | Err(TryRecvError::Disconnected) => {}
                Err(TryRecvError::Empty) => pending = Some(stale),
            }
        }

        let mut detections: Vec<ObjectDetection> = Vec::new();
        for region in &regions {
            if pending.is_some() {
                metrics.queue_full_skips.fetch_add(1, Ordering::Relaxed);
                break;
            }
            // one outstanding request per camera: render, submit, wait
            render_region(
                &luma,
                region,
                ctx.model_input_side as usize,
                input_slot.tensor_mut(),
            );
            let reply = match pool.try_request(&ctx.camera, sequence, *region) {
                Ok(reply) => reply,
                Err(DetectError::QueueFull) => {
                    // skip the rest of this frame's inference
                    metrics.queue_full_skips.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(_) => {
                    warn!(camera = %ctx.camera, "detector pool shut down");
                    break;
                }
            };
            match reply.recv_timeout(ctx.detect_timeout) {
                Ok(Ok(outcome)) => {
                    detection_fps.update(UnixTime::now());
                    detections.extend(rows_to_detections(
                        &outcome.rows,
                        *region,
                        &ctx.labels,
                    ));
                }
                Ok(Err(DetectError::Unavailable)) => {
                    metrics
                        .detector_unavailable
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(_)) => {}
                Err(RecvTimeoutError::Timeout) => {
                    metrics.detector_timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(camera = %ctx.camera, "detection timed out; treating frame as empty");
                    pending = Some(reply);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(camera = %ctx.camera, "detector pool shut down");
                    break;
                }
            }
        }

        planner.note_detections(
            &detections.iter().map(|d| d.rect).collect::<Vec<_>>(),
        );

        let deltas = tracker.observe(sequence, at, &detections);
        for delta in deltas {
            let _ = events_tx.send(PipelineEvent::Delta {
                camera: ctx.camera.clone(),
                at,
                delta,
            });
        }

        let now = UnixTime::now();
        process_fps.update(now);
        CameraMetrics::store_fps(&metrics.process_fps_millis, process_fps.eps(now));
        CameraMetrics::store_fps(&metrics.detection_fps_millis, detection_fps.eps(now));
        metrics
            .active_objects
            .store(tracker.active_count() as u64, Ordering::Relaxed);
        metrics.out_of_order_dropped.store(
            tracker.counters().out_of_order_dropped,
            Ordering::Relaxed,
        );
        drop(frame);
    }

    // close out live objects so downstream events end cleanly
    let now = UnixTime::now();
    for snapshot in tracker.drain(now) {
        let _ = events_tx.send(PipelineEvent::Delta {
            camera: ctx.camera.clone(),
            at: now,
            delta: TrackerDelta::Ended(snapshot),
        });
    }
    debug!(camera = %ctx.camera, "pipeline worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_to_detections_maps_region_coords() {
        let labels: BTreeMap<u32, String> = [(0, "person".to_string())].into();
        let region = SquareRegion {
            x: 100,
            y: 200,
            side: 400,
        };
        let rows = vec![DetectionRow {
            class_id: 0,
            score: 0.8,
            y1: 0.25,
            x1: 0.5,
            y2: 0.75,
            x2: 1.0,
        }];
        let detections = rows_to_detections(&rows, region, &labels);
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.label, "person");
        assert_eq!(d.rect, PixelRect::new(300, 300, 500, 500));
        assert_eq!(d.region, region);
    }

    #[test]
    fn test_unknown_class_gets_unknown_label() {
        let labels = BTreeMap::new();
        let region = SquareRegion {
            x: 0,
            y: 0,
            side: 100,
        };
        let rows = vec![DetectionRow {
            class_id: 42,
            score: 0.5,
            y1: 0.0,
            x1: 0.0,
            y2: 1.0,
            x2: 1.0,
        }];
        let detections = rows_to_detections(&rows, region, &labels);
        assert_eq!(detections[0].label, "unknown");
    }
}
