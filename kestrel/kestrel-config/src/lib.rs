//! Configuration model and YAML loader.
//!
//! The configuration is consumed once at startup. Anything structurally wrong
//! (unknown fields, duplicate keys, an invalid zone polygon) must fail before
//! a single worker is spawned, so all checks happen inside
//! [`parse_config_file`] / [`KestrelConfig::validate`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod unique_map;
pub use unique_map::de_unique_map;

/// Environment variable that overrides the default configuration path.
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

pub const DEFAULT_CONFIG_PATH: &str = "/config/kestrel.yml";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVar {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_true() -> bool {
    true
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm/kestrel")
}

fn default_record_dir() -> PathBuf {
    PathBuf::from("/media/kestrel/recordings")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/cache")
}

fn default_clips_dir() -> PathBuf {
    PathBuf::from("/media/kestrel/clips")
}

fn default_detect_fps() -> u32 {
    5
}

fn default_detect_width() -> u32 {
    1280
}

fn default_detect_height() -> u32 {
    720
}

fn default_max_disappeared() -> u32 {
    25
}

fn default_motion_frame_height() -> u32 {
    100
}

fn default_motion_threshold() -> u8 {
    30
}

fn default_contour_area() -> u32 {
    10
}

fn default_frame_alpha() -> f32 {
    0.01
}

fn default_zone_inertia() -> u32 {
    3
}

fn default_model_input_side() -> u32 {
    320
}

fn default_retain_days() -> f64 {
    10.0
}

fn default_pre_capture() -> f64 {
    5.0
}

fn default_post_capture() -> f64 {
    5.0
}

fn default_tracked_labels() -> Vec<String> {
    vec!["person".to_string()]
}

fn default_min_score() -> f32 {
    0.5
}

fn default_stationary_threshold_px() -> u32 {
    10
}

fn default_stationary_threshold_secs() -> f64 {
    10.0
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KestrelConfig {
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_clips_dir")]
    pub clips_dir: PathBuf,
    /// Total shared-memory budget in bytes used for arena sizing. `None`
    /// means "read from the OS at startup".
    #[serde(default)]
    pub shm_total_bytes: Option<u64>,
    /// Whether the composite mosaic output stream is enabled (reserves
    /// additional shared memory).
    #[serde(default)]
    pub mosaic_output: bool,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub record: RecordRetainConfig,
    #[serde(deserialize_with = "de_unique_map")]
    pub detectors: BTreeMap<String, DetectorConfig>,
    #[serde(deserialize_with = "de_unique_map")]
    pub cameras: BTreeMap<String, CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    #[serde(rename = "type")]
    pub kind: DetectorKind,
    /// Device selector, e.g. a CUDA ordinal or EdgeTPU path.
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Cpu,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Square model input side `S`; the input slot is `S*S*3` bytes.
    #[serde(default = "default_model_input_side")]
    pub input_side: u32,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Label map file, one label per line or `index label` pairs.
    #[serde(default)]
    pub labelmap_path: Option<PathBuf>,
    #[serde(default)]
    pub output_schema: ModelOutputSchema,
    /// Maps several model class ids onto one user-facing label.
    #[serde(default)]
    pub class_aggregation: BTreeMap<String, Vec<u32>>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            input_side: default_model_input_side(),
            path: None,
            labelmap_path: None,
            output_schema: ModelOutputSchema::default(),
            class_aggregation: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelOutputSchema {
    /// Four tensors: boxes, class ids, scores, count.
    #[default]
    Ssd,
    /// Single tensor, dequantized and NMS-filtered host-side.
    Yolo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordRetainConfig {
    /// Default retention in days for event segments.
    #[serde(default = "default_retain_days")]
    pub default_days: f64,
    /// Per-label retention overrides in days.
    #[serde(default)]
    pub objects: BTreeMap<String, f64>,
}

impl Default for RecordRetainConfig {
    fn default() -> Self {
        RecordRetainConfig {
            default_days: default_retain_days(),
            objects: BTreeMap::new(),
        }
    }
}

/// Which point of a bounding box is tested against zone polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAnchorConfig {
    Centroid,
    #[default]
    BottomCenter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub input: InputConfig,
    #[serde(default)]
    pub zone_anchor: ZoneAnchorConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default, deserialize_with = "de_unique_map")]
    pub zones: BTreeMap<String, ZoneConfig>,
    #[serde(default)]
    pub objects: ObjectsConfig,
    #[serde(default)]
    pub record: CameraRecordConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// Stream source passed to the decoder. May contain `$VAR` / `${VAR}`
    /// environment references.
    pub path: String,
    #[serde(default)]
    pub roles: Vec<StreamRole>,
    /// Extra decoder arguments inserted before the input.
    #[serde(default)]
    pub hwaccel_args: Vec<String>,
    #[serde(default)]
    pub input_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Detect,
    Record,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectConfig {
    #[serde(default = "default_detect_width")]
    pub width: u32,
    #[serde(default = "default_detect_height")]
    pub height: u32,
    #[serde(default = "default_detect_fps")]
    pub fps: u32,
    /// Consecutive missed frames before a tracked object is dropped.
    #[serde(default = "default_max_disappeared")]
    pub max_disappeared: u32,
    #[serde(default)]
    pub stationary: StationaryConfig,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            width: default_detect_width(),
            height: default_detect_height(),
            fps: default_detect_fps(),
            max_disappeared: default_max_disappeared(),
            stationary: StationaryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationaryConfig {
    /// Maximum centroid wander in pixels while still counting as stationary.
    #[serde(default = "default_stationary_threshold_px")]
    pub threshold: u32,
    #[serde(default = "default_stationary_threshold_secs")]
    pub threshold_seconds: f64,
}

impl Default for StationaryConfig {
    fn default() -> Self {
        StationaryConfig {
            threshold: default_stationary_threshold_px(),
            threshold_seconds: default_stationary_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotionConfig {
    /// Height the luma plane is downscaled to for motion analysis.
    #[serde(default = "default_motion_frame_height")]
    pub frame_height: u32,
    #[serde(default = "default_motion_threshold")]
    pub threshold: u8,
    /// Minimum component pixel area counted as motion, in downscaled
    /// coordinates.
    #[serde(default = "default_contour_area")]
    pub contour_area: u32,
    /// Background accumulation weight.
    #[serde(default = "default_frame_alpha")]
    pub frame_alpha: f32,
    #[serde(default)]
    pub improve_contrast: bool,
    /// Mask polygons in normalized coordinates; masked pixels never count as
    /// motion.
    #[serde(default)]
    pub mask: Vec<Vec<(f64, f64)>>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            frame_height: default_motion_frame_height(),
            threshold: default_motion_threshold(),
            contour_area: default_contour_area(),
            frame_alpha: default_frame_alpha(),
            improve_contrast: false,
            mask: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// Polygon vertices in detect-resolution pixel coordinates.
    pub coordinates: Vec<(f64, f64)>,
    /// Continuous frames inside the polygon before the zone counts as
    /// entered.
    #[serde(default = "default_zone_inertia")]
    pub inertia: u32,
    /// Seconds an object must remain before a loitering flag is raised;
    /// zero disables.
    #[serde(default)]
    pub loitering_time: f64,
    /// Restrict the zone to these labels (empty = all tracked labels).
    #[serde(default)]
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectsConfig {
    #[serde(default = "default_tracked_labels")]
    pub track: Vec<String>,
    #[serde(default, deserialize_with = "de_unique_map")]
    pub filters: BTreeMap<String, FilterConfig>,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        ObjectsConfig {
            track: default_tracked_labels(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub min_area: Option<i64>,
    #[serde(default)]
    pub max_area: Option<i64>,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Score at which a candidate is confirmed immediately.
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraRecordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds of recording preserved before the event start.
    #[serde(default = "default_pre_capture")]
    pub pre_capture: f64,
    /// Seconds of recording preserved after the event end.
    #[serde(default = "default_post_capture")]
    pub post_capture: f64,
    #[serde(default)]
    pub retain: Option<RecordRetainConfig>,
}

impl Default for CameraRecordConfig {
    fn default() -> Self {
        CameraRecordConfig {
            enabled: true,
            pre_capture: default_pre_capture(),
            post_capture: default_post_capture(),
            retain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reject snapshot candidates whose box touches the frame edge.
    #[serde(default = "default_true")]
    pub reject_clipped: bool,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        SnapshotsConfig {
            enabled: true,
            reject_clipped: true,
        }
    }
}

impl KestrelConfig {
    /// Structural checks beyond what serde enforces. Everything reported
    /// here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.detectors.is_empty() {
            return Err(Error::Invalid("at least one detector is required".into()));
        }
        if self.cameras.is_empty() {
            return Err(Error::Invalid("at least one camera is required".into()));
        }
        for (name, cam) in &self.cameras {
            if cam.detect.width == 0 || cam.detect.height == 0 {
                return Err(Error::Invalid(format!(
                    "camera {name}: detect resolution must be nonzero"
                )));
            }
            if cam.detect.fps == 0 {
                return Err(Error::Invalid(format!(
                    "camera {name}: detect fps must be nonzero"
                )));
            }
            if cam.motion.frame_height == 0 {
                return Err(Error::Invalid(format!(
                    "camera {name}: motion frame_height must be nonzero"
                )));
            }
            for (zone_name, zone) in &cam.zones {
                if zone.coordinates.len() < 3 {
                    return Err(Error::Invalid(format!(
                        "camera {name}: zone {zone_name} needs at least 3 vertices"
                    )));
                }
            }
        }
        if self.model.input_side == 0 {
            return Err(Error::Invalid("model input_side must be nonzero".into()));
        }
        Ok(())
    }

    /// Effective retention policy for one camera.
    pub fn retain_for<'a>(&'a self, cam: &'a CameraConfig) -> &'a RecordRetainConfig {
        cam.record.retain.as_ref().unwrap_or(&self.record)
    }
}

impl RecordRetainConfig {
    pub fn days_for_label(&self, label: &str) -> f64 {
        self.objects.get(label).copied().unwrap_or(self.default_days)
    }
}

/// Resolve the configuration path: `CONFIG_FILE` env var, else the default.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_FILE_ENV) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Read, parse and validate a configuration file. Camera input paths have
/// `~` and environment variables expanded.
pub fn parse_config_file<P: AsRef<std::path::Path>>(path: P) -> Result<KestrelConfig> {
    let buf = std::fs::read_to_string(path.as_ref())?;
    parse_config_str(&buf)
}

pub fn parse_config_str(buf: &str) -> Result<KestrelConfig> {
    let mut cfg: KestrelConfig = serde_yaml::from_str(buf)?;
    for cam in cfg.cameras.values_mut() {
        let expanded = shellexpand::full(&cam.input.path)?;
        cam.input.path = expanded.to_string();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
detectors:
  coral:
    type: cpu
cameras:
  front_door:
    input:
      path: rtsp://127.0.0.1:8554/front
      roles: [detect, record]
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = parse_config_str(MINIMAL).unwrap();
        let cam = &cfg.cameras["front_door"];
        assert!(cam.enabled);
        assert_eq!(cam.detect.fps, 5);
        assert_eq!(cam.detect.max_disappeared, 25);
        assert_eq!(cam.motion.threshold, 30);
        assert_eq!(cfg.model.input_side, 320);
        assert_eq!(cfg.record.days_for_label("person"), 10.0);
    }

    #[test]
    fn test_duplicate_camera_key_rejected() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  front_door:
    input:
      path: rtsp://a
  front_door:
    input:
      path: rtsp://b
"#;
        let err = parse_config_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  c:
    enabled: true
    enabled: false
    input:
      path: rtsp://a
"#;
        assert!(parse_config_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  c:
    input:
      path: rtsp://a
    no_such_field: 1
"#;
        assert!(parse_config_str(yaml).is_err());
    }

    #[test]
    fn test_zone_needs_three_vertices() {
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  c:
    input:
      path: rtsp://a
    zones:
      porch:
        coordinates: [[0, 0], [100, 0]]
"#;
        let err = parse_config_str(yaml).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_env_expansion_in_input_path() {
        std::env::set_var("KESTREL_TEST_CAM_HOST", "cam.local");
        let yaml = r#"
detectors:
  d:
    type: cpu
cameras:
  c:
    input:
      path: rtsp://${KESTREL_TEST_CAM_HOST}:8554/live
"#;
        let cfg = parse_config_str(yaml).unwrap();
        assert_eq!(cfg.cameras["c"].input.path, "rtsp://cam.local:8554/live");
    }

    #[test]
    fn test_no_detectors_is_invalid() {
        let yaml = r#"
detectors: {}
cameras:
  c:
    input:
      path: rtsp://a
"#;
        assert!(matches!(
            parse_config_str(yaml).unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[test]
    fn test_retain_override_per_camera() {
        let yaml = r#"
record:
  default_days: 7
  objects:
    car: 3
detectors:
  d:
    type: cpu
cameras:
  c:
    input:
      path: rtsp://a
    record:
      retain:
        default_days: 30
"#;
        let cfg = parse_config_str(yaml).unwrap();
        assert_eq!(cfg.record.days_for_label("car"), 3.0);
        let cam = &cfg.cameras["c"];
        assert_eq!(cfg.retain_for(cam).days_for_label("car"), 30.0);
    }
}
