//! Supervisor wiring: per-camera pipelines, the shared detector pool, the
//! event loop with its serialized store writes, recording maintenance and
//! the watchdog.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use accel_detect::{
    BackendFactory, ClassAggregation, DetectorPool, PoolSettings, PostProcess, StaticBackend,
    DETECT_TIMEOUT,
};
use cam_capture::{
    spawn_capture_worker, CaptureHandle, CaptureSettings, DecoderChild, SourceFactory,
};
use frame_arena::{
    arena_path, detection_input_path, detection_result_path, slots_for_budget,
    DetectionInputSlot, DetectionResultSlot, FrameArena,
};
use kestrel_config::{DetectorKind, KestrelConfig, ModelOutputSchema, ZoneAnchorConfig};
use kestrel_events::{EventEngine, EventSettings};
use kestrel_record::{
    purge_duplicate_events, prune_expired_segments, EventTable, RecordingSegmenter, RetainMode,
    RetainPolicy, SegmenterSettings, StoredSegment,
};
use kestrel_track::{
    LabelFilter, ObjectTracker, TrackerSettings, ZoneAnchor, ZoneDef,
};
use kestrel_types::{CamName, Polygon, UnixTime};
use motion_detect::{MotionDetector, MotionSettings};
use region_planner::{RegionPlanner, RegionSettings};

use crate::labels;
use crate::pipeline::{run_camera_pipeline, PipelineContext, PipelineEvent};
use crate::stats::{CameraMetrics, CameraStats, DetectorStats, RateTracker, StatsSnapshot};

/// Seconds without a frame before the watchdog restarts a decoder.
const WATCHDOG_FRAME_STALE_SECS: f64 = 30.0;

/// Seconds without an inference before the watchdog restarts a worker.
const WATCHDOG_INFERENCE_STALE_SECS: f64 = 60.0;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(10);
const STATS_PERIOD: Duration = Duration::from_secs(60);

/// Gap above which a new motion window opens instead of extending the last.
const MOTION_MERGE_GAP_SECS: f64 = 3.0;

/// Motion windows older than this are discarded.
const MOTION_WINDOW_HORIZON_SECS: f64 = 3600.0;

struct CameraRuntime {
    camera: CamName,
    arena: Arc<FrameArena>,
    capture: CaptureHandle,
    pipeline_join: Option<std::thread::JoinHandle<()>>,
    metrics: Arc<CameraMetrics>,
}

/// Per-camera motion activity, coalesced into time windows for segment
/// classification.
#[derive(Debug, Default)]
pub struct MotionWindows {
    windows: BTreeMap<CamName, Vec<(UnixTime, UnixTime)>>,
}

impl MotionWindows {
    pub fn note(&mut self, camera: &CamName, at: UnixTime) {
        let windows = self.windows.entry(camera.clone()).or_default();
        match windows.last_mut() {
            Some((_, end)) if at.since(*end) <= MOTION_MERGE_GAP_SECS => {
                if at > *end {
                    *end = at;
                }
            }
            _ => windows.push((at, at)),
        }
    }

    pub fn for_camera(&self, camera: &CamName) -> &[(UnixTime, UnixTime)] {
        self.windows
            .get(camera)
            .map(|w| w.as_slice())
            .unwrap_or(&[])
    }

    pub fn prune(&mut self, now: UnixTime) {
        for windows in self.windows.values_mut() {
            windows.retain(|(_, end)| now.since(*end) <= MOTION_WINDOW_HORIZON_SECS);
        }
    }
}

fn ensure_dirs(cfg: &KestrelConfig) -> Result<()> {
    let mut dirs = vec![
        cfg.record_dir.clone(),
        cfg.clips_dir.clone(),
        cfg.shm_dir.clone(),
    ];
    for name in cfg.cameras.keys() {
        dirs.push(cfg.cache_dir.join(name));
    }
    for dir in dirs {
        std::fs::create_dir_all(&dir).wrap_err_with(|| format!("creating {dir:?}"))?;
    }
    Ok(())
}

/// Size of the filesystem backing the shm directory.
fn detect_shm_total(shm_dir: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let path = std::ffi::CString::new(shm_dir.as_os_str().as_bytes())?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).wrap_err("statvfs on shm dir");
    }
    Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
}

fn motion_settings(cfg: &kestrel_config::CameraConfig) -> MotionSettings {
    let width = cfg.detect.width as f64;
    let height = cfg.detect.height as f64;
    MotionSettings {
        frame_height: cfg.motion.frame_height,
        threshold: cfg.motion.threshold,
        contour_area: cfg.motion.contour_area,
        frame_alpha: cfg.motion.frame_alpha,
        improve_contrast: cfg.motion.improve_contrast,
        mask: cfg
            .motion
            .mask
            .iter()
            .filter_map(|points| {
                Polygon::new(
                    points
                        .iter()
                        .map(|(x, y)| (x * width, y * height))
                        .collect(),
                )
            })
            .collect(),
    }
}

fn tracker_settings(name: &str, cfg: &kestrel_config::CameraConfig) -> TrackerSettings {
    let mut settings = TrackerSettings::minimal(
        CamName::new(name),
        cfg.detect.width,
        cfg.detect.height,
    );
    settings.max_disappeared = cfg.detect.max_disappeared;
    settings.stationary_threshold_px = cfg.detect.stationary.threshold;
    settings.stationary_threshold_secs = cfg.detect.stationary.threshold_seconds;
    settings.tracked_labels = cfg.objects.track.clone();
    settings.snapshot_reject_clipped = cfg.snapshots.reject_clipped;
    settings.zone_anchor = match cfg.zone_anchor {
        ZoneAnchorConfig::Centroid => ZoneAnchor::Centroid,
        ZoneAnchorConfig::BottomCenter => ZoneAnchor::BottomCenter,
    };
    settings.filters = cfg
        .objects
        .filters
        .iter()
        .map(|(label, filter)| {
            (
                label.clone(),
                LabelFilter {
                    min_area: filter.min_area,
                    max_area: filter.max_area,
                    min_score: filter.min_score,
                    fast_confirm: filter.threshold,
                },
            )
        })
        .collect();
    settings.zones = cfg
        .zones
        .iter()
        .filter_map(|(zone_name, zone)| {
            Some(ZoneDef {
                name: zone_name.clone(),
                polygon: Polygon::new(zone.coordinates.clone())?,
                inertia: zone.inertia,
                loitering_time: zone.loitering_time,
                objects: zone.objects.clone(),
            })
        })
        .collect();
    settings
}

fn backend_factory(
    name: &str,
    kind: DetectorKind,
    device: Option<String>,
    model: &kestrel_config::ModelConfig,
) -> BackendFactory {
    let name = name.to_string();
    let model_path = model.path.clone();
    let input_side = model.input_side;
    let yolo = model.output_schema == ModelOutputSchema::Yolo;
    Box::new(move || {
        let _ = &device;
        match (&model_path, kind) {
            (None, _) => {
                warn!(
                    detector = %name,
                    "no model configured; detector will report nothing"
                );
                Ok(Box::new(StaticBackend::empty(&name)))
            }
            #[cfg(feature = "onnx")]
            (Some(path), DetectorKind::Cpu | DetectorKind::Onnx) => {
                let backend =
                    accel_detect::OnnxBackend::load(&name, path, input_side as usize, yolo)?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "onnx"))]
            (Some(path), _) => {
                let _ = (path, input_side, yolo);
                Err(accel_detect::BackendError::ModelLoadFailed(
                    "built without the `onnx` feature; cannot load a model".to_string(),
                ))
            }
        }
    })
}

fn class_aggregation(model: &kestrel_config::ModelConfig, labels: &BTreeMap<u32, String>) -> ClassAggregation {
    let groups = model
        .class_aggregation
        .iter()
        .filter_map(|(label, members)| {
            let out = labels
                .iter()
                .find(|(_, l)| l.as_str() == label)
                .map(|(id, _)| *id)?;
            Some((out, members.clone()))
        })
        .collect();
    ClassAggregation::new(groups)
}

pub async fn run(cfg: KestrelConfig, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    ensure_dirs(&cfg)?;

    let label_map = Arc::new(match &cfg.model.labelmap_path {
        Some(path) => labels::load_labels(path)?,
        None => labels::default_labels(),
    });

    let shm_total = match cfg.shm_total_bytes {
        Some(bytes) => bytes,
        None => detect_shm_total(&cfg.shm_dir)?,
    };
    info!("shared memory budget: {} MiB", shm_total / (1024 * 1024));

    // detector pool, shared by every camera
    let pool_settings = PoolSettings {
        shm_dir: cfg.shm_dir.clone(),
        input_side: cfg.model.input_side,
        postprocess: PostProcess {
            input_side: cfg.model.input_side,
            aggregation: class_aggregation(&cfg.model, &label_map),
        },
    };
    let factories: Vec<(String, BackendFactory)> = cfg
        .detectors
        .iter()
        .map(|(name, det)| {
            (
                name.clone(),
                backend_factory(name, det.kind, det.device.clone(), &cfg.model),
            )
        })
        .collect();
    let pool = Arc::new(
        DetectorPool::spawn(factories, pool_settings)
            .map_err(|e| eyre!("starting detectors: {e}"))?,
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel::<PipelineEvent>();
    let (bus_tx, _) = tokio::sync::broadcast::channel::<(String, String)>(256);

    let mut engine = EventEngine::new();
    let mut cameras: Vec<CameraRuntime> = Vec::new();

    for (name, cam_cfg) in &cfg.cameras {
        if !cam_cfg.enabled {
            info!(camera = %name, "camera disabled, skipping");
            continue;
        }
        let camera = CamName::new(name.clone());
        let (width, height) = (cam_cfg.detect.width, cam_cfg.detect.height);

        let slots = slots_for_budget(shm_total, cfg.mosaic_output, width, height)
            .map_err(|e| eyre!("camera {name}: {e}"))?;
        let arena = FrameArena::create(
            &arena_path(&cfg.shm_dir, name),
            camera.clone(),
            width,
            height,
            slots,
        )?;
        let input_slot =
            DetectionInputSlot::create(&detection_input_path(&cfg.shm_dir, name), cfg.model.input_side)?;
        DetectionResultSlot::create(&detection_result_path(&cfg.shm_dir, name))?;

        let frames = arena.register_consumer("process", 4);

        engine.register_camera(
            camera.clone(),
            EventSettings {
                pre_capture: cam_cfg.record.pre_capture,
                post_capture: cam_cfg.record.post_capture,
            },
        );

        let mut capture_settings = CaptureSettings::new(
            camera.clone(),
            width,
            height,
            cam_cfg.detect.fps,
            cam_cfg.input.path.clone(),
        );
        capture_settings.hwaccel_args = cam_cfg.input.hwaccel_args.clone();
        capture_settings.input_args = cam_cfg.input.input_args.clone();
        if cam_cfg.record.enabled {
            capture_settings.record_cache_dir = Some(cfg.cache_dir.join(name));
        }
        let decoder_settings = capture_settings.clone();
        let source_factory: SourceFactory = Box::new(move || {
            Ok(Box::new(DecoderChild::spawn(&decoder_settings)?))
        });
        let capture =
            spawn_capture_worker(capture_settings, arena.clone(), source_factory, stop.clone());

        let metrics = Arc::new(CameraMetrics::default());
        let ctx = PipelineContext {
            camera: camera.clone(),
            width,
            height,
            model_input_side: cfg.model.input_side,
            detect_timeout: DETECT_TIMEOUT,
            labels: label_map.clone(),
        };
        let motion = MotionDetector::new(width, height, motion_settings(cam_cfg));
        let planner = RegionPlanner::new(
            width,
            height,
            RegionSettings {
                min_region: cfg.model.input_side as i64,
                max_regions: 3,
            },
        );
        let tracker = ObjectTracker::new(tracker_settings(name, cam_cfg));

        let pipeline_join = std::thread::Builder::new()
            .name(format!("pipeline-{camera}"))
            .spawn({
                let pool = pool.clone();
                let events_tx = events_tx.clone();
                let metrics = metrics.clone();
                let stop = stop.clone();
                move || {
                    run_camera_pipeline(
                        ctx, frames, motion, planner, tracker, input_slot, pool, events_tx,
                        metrics, stop,
                    )
                }
            })
            .expect("spawn pipeline thread");

        info!(camera = %camera, slots, "camera started");
        cameras.push(CameraRuntime {
            camera,
            arena,
            capture,
            pipeline_join: Some(pipeline_join),
            metrics,
        });
    }
    drop(events_tx);

    if cameras.is_empty() {
        return Err(eyre!("no enabled cameras"));
    }

    // recording segmenter + retention policies per camera
    let segmenter = RecordingSegmenter::new(SegmenterSettings {
        cache_dir: cfg.cache_dir.clone(),
        record_dir: cfg.record_dir.clone(),
        segment_duration: 10.0,
        retain_mode: RetainMode::Motion,
    });
    let retain_policies: BTreeMap<CamName, RetainPolicy> = cfg
        .cameras
        .iter()
        .map(|(name, cam_cfg)| {
            let retain = cfg.retain_for(cam_cfg);
            (
                CamName::new(name.clone()),
                RetainPolicy {
                    default_days: retain.default_days,
                    objects: retain.objects.clone(),
                },
            )
        })
        .collect();

    let camera_names: Vec<CamName> = cameras.iter().map(|c| c.camera.clone()).collect();
    let shared_table = Arc::new(Mutex::new(EventTable::new()));
    // external dispatchers (MQTT, websocket) would subscribe here; keeping
    // one receiver open means sends do not error while none are attached
    let _bus_keepalive = bus_tx.subscribe();

    // event loop: serialized store writes, bus emission, recording
    // maintenance
    let event_loop = {
        let clips_dir = cfg.clips_dir.clone();
        let bus_tx = bus_tx.clone();
        let table = shared_table.clone();
        tokio::spawn(async move {
            let mut events_rx = events_rx;
            let mut motion_windows = MotionWindows::default();
            let mut stored_segments: Vec<StoredSegment> = Vec::new();
            let mut maintenance = tokio::time::interval(MAINTENANCE_PERIOD);
            maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        match event {
                            Some(PipelineEvent::Delta { camera, at: _, delta }) => {
                                let now = UnixTime::now();
                                if let Some(message) = engine.handle(now, delta) {
                                    let topic = format!("kestrel/events/{camera}");
                                    match serde_json::to_string(&message) {
                                        Ok(payload) => {
                                            let _ = bus_tx.send((topic, payload));
                                        }
                                        Err(err) => error!("event serialization: {err}"),
                                    }
                                    table.lock().apply(&message);
                                }
                            }
                            Some(PipelineEvent::Motion { camera, at }) => {
                                motion_windows.note(&camera, at);
                            }
                            None => break,
                        }
                    }
                    _ = maintenance.tick() => {
                        let now = UnixTime::now();
                        motion_windows.prune(now);
                        let mut table = table.lock();
                        for camera in &camera_names {
                            match segmenter.ingest_finalized(
                                camera,
                                &table,
                                motion_windows.for_camera(camera),
                                now,
                            ) {
                                Ok(mut stored) => stored_segments.append(&mut stored),
                                Err(err) => {
                                    warn!(camera = %camera, "segment ingest failed: {err}");
                                }
                            }
                            if let Some(policy) = retain_policies.get(camera) {
                                prune_expired_segments(
                                    &mut stored_segments,
                                    &table,
                                    policy,
                                    segmenter.settings().segment_duration,
                                    now,
                                );
                            }
                        }
                        let removed = purge_duplicate_events(&mut table, &clips_dir);
                        if !removed.is_empty() {
                            info!("removed {} duplicate events", removed.len());
                        }
                        table.drop_medialess_ended();
                    }
                }
            }
            // close out whatever is still live
            let now = UnixTime::now();
            let mut table = table.lock();
            for message in engine.close_all(now) {
                let topic = format!("kestrel/events/{}", message.camera);
                if let Ok(payload) = serde_json::to_string(&message) {
                    let _ = bus_tx.send((topic, payload));
                }
                table.apply(&message);
            }
        })
    };

    // watchdog: decoder frame staleness and worker inference staleness
    let watchdog = {
        let pool = pool.clone();
        let statuses: Vec<(CamName, cam_capture::CaptureStatus, Arc<AtomicBool>)> = cameras
            .iter()
            .map(|c| {
                (
                    c.camera.clone(),
                    c.capture.status.clone(),
                    c.capture.restart_flag(),
                )
            })
            .collect();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let now = UnixTime::now();
                for (camera, status, restart) in &statuses {
                    if let Some(last) = status.last_frame() {
                        if now.since(last) > WATCHDOG_FRAME_STALE_SECS {
                            warn!(camera = %camera, "no frames for 30s; restarting decoder");
                            restart.store(true, Ordering::Relaxed);
                        }
                    }
                }
                for (index, info) in pool.worker_infos().iter().enumerate() {
                    if let Some(last) = info.last_inference() {
                        if now.since(last) > WATCHDOG_INFERENCE_STALE_SECS {
                            warn!(worker = %info.name, "inference stalled; restarting worker");
                            pool.restart_worker(index);
                        }
                    }
                }
            }
        })
    };

    // periodic stats snapshot, logged and published on the bus
    let stats_task = {
        let pool = pool.clone();
        let table = shared_table.clone();
        let bus_tx = bus_tx.clone();
        let cameras: Vec<(CamName, Arc<FrameArena>, cam_capture::CaptureStatus, Arc<CameraMetrics>)> =
            cameras
                .iter()
                .map(|c| {
                    (
                        c.camera.clone(),
                        c.arena.clone(),
                        c.capture.status.clone(),
                        c.metrics.clone(),
                    )
                })
                .collect();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut rates = RateTracker::default();
            let mut interval = tokio::time::interval(STATS_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let now = UnixTime::now();
                let snapshot = assemble_stats(&cameras, &pool, &table.lock(), &mut rates, now);
                match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        info!("stats: {json}");
                        let _ = bus_tx.send(("kestrel/stats".to_string(), json));
                    }
                    Err(err) => error!("stats serialization: {err}"),
                }
            }
        })
    };

    shutdown.await;
    info!("shutting down");
    stop.store(true, Ordering::Relaxed);

    // workers drain their inputs with short deadlines and exit
    let joins: Vec<std::thread::JoinHandle<()>> = cameras
        .iter_mut()
        .filter_map(|c| c.pipeline_join.take())
        .collect();
    let captures: Vec<CaptureHandle> = cameras.into_iter().map(|c| c.capture).collect();
    tokio::task::spawn_blocking(move || {
        for capture in captures {
            capture.join();
        }
        for join in joins {
            let _ = join.join();
        }
    })
    .await
    .wrap_err("joining workers")?;

    // event loop ends once every pipeline sender is gone
    event_loop.await.wrap_err("event loop")?;
    watchdog.abort();
    stats_task.abort();

    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown(),
        Err(_) => warn!("detector pool still referenced at shutdown"),
    }
    info!("shutdown complete");
    Ok(())
}

fn assemble_stats(
    cameras: &[(CamName, Arc<FrameArena>, cam_capture::CaptureStatus, Arc<CameraMetrics>)],
    pool: &DetectorPool,
    table: &EventTable,
    rates: &mut RateTracker,
    now: UnixTime,
) -> StatsSnapshot {
    let mut camera_stats = BTreeMap::new();
    for (camera, arena, status, metrics) in cameras {
        let skipped_total = arena.skipped_for("process");
        camera_stats.insert(
            camera.as_str().to_string(),
            CameraStats {
                camera_fps: status.camera_fps(),
                process_fps: CameraMetrics::load_fps(&metrics.process_fps_millis),
                detection_fps: CameraMetrics::load_fps(&metrics.detection_fps_millis),
                skipped_fps: rates.rate(camera.as_str(), now, skipped_total),
                skipped_total,
                decoder_pid: status.pid(),
                decoder_restarts: status.restarts(),
                active_objects: metrics.active_objects.load(Ordering::Relaxed),
                detector_timeouts: metrics.detector_timeouts.load(Ordering::Relaxed),
                detector_unavailable: metrics.detector_unavailable.load(Ordering::Relaxed),
                queue_full_skips: metrics.queue_full_skips.load(Ordering::Relaxed),
            },
        );
    }
    let detectors = pool
        .worker_infos()
        .iter()
        .map(|info| DetectorStats {
            name: info.name.clone(),
            last_inference_age_secs: info.last_inference().map(|at| now.since(at)),
        })
        .collect();
    StatsSnapshot {
        at: now,
        cameras: camera_stats,
        detectors,
        events_live: table.rows().filter(|r| r.end_time.is_none()).count(),
        events_total: table.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_windows_merge_and_prune() {
        let camera = CamName::new("front");
        let mut windows = MotionWindows::default();
        windows.note(&camera, UnixTime(1000.0));
        windows.note(&camera, UnixTime(1001.0));
        windows.note(&camera, UnixTime(1002.5));
        // gap > 3s opens a second window
        windows.note(&camera, UnixTime(1010.0));
        assert_eq!(
            windows.for_camera(&camera),
            &[
                (UnixTime(1000.0), UnixTime(1002.5)),
                (UnixTime(1010.0), UnixTime(1010.0))
            ]
        );

        windows.prune(UnixTime(1002.5 + 3600.0 + 1.0));
        assert_eq!(windows.for_camera(&camera).len(), 1);
    }

    #[test]
    fn test_tracker_settings_conversion() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  front:
    zone_anchor: centroid
    input:
      path: rtsp://cam
    detect:
      width: 640
      height: 480
      max_disappeared: 10
    objects:
      track: [person, car]
      filters:
        person:
          min_area: 1000
          threshold: 0.9
    zones:
      porch:
        coordinates: [[0, 0], [100, 0], [100, 100]]
        inertia: 5
"#;
        let cfg = kestrel_config::parse_config_str(yaml).unwrap();
        let settings = tracker_settings("front", &cfg.cameras["front"]);
        assert_eq!(settings.max_disappeared, 10);
        assert_eq!(settings.zone_anchor, ZoneAnchor::Centroid);
        assert_eq!(settings.tracked_labels, vec!["person", "car"]);
        assert_eq!(settings.zones.len(), 1);
        assert_eq!(settings.zones[0].inertia, 5);
        let filter = &settings.filters["person"];
        assert_eq!(filter.min_area, Some(1000));
        assert_eq!(filter.fast_confirm, Some(0.9));
    }

    #[test]
    fn test_motion_settings_scale_normalized_masks() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  front:
    input:
      path: rtsp://cam
    detect:
      width: 1000
      height: 500
    motion:
      mask:
        - [[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]]
"#;
        let cfg = kestrel_config::parse_config_str(yaml).unwrap();
        let settings = motion_settings(&cfg.cameras["front"]);
        assert_eq!(settings.mask.len(), 1);
        // masked on the left half at source resolution
        assert!(settings.mask[0].contains(250.0, 250.0));
        assert!(!settings.mask[0].contains(750.0, 250.0));
    }
}
