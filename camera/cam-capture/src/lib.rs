//! Decoder child-process supervision and raw frame capture.
//!
//! One capture worker per camera owns the decoder child, reads raw YUV
//! frames from its stdout in exact frame-size chunks and publishes them into
//! the camera's frame arena. Decoder death is handled locally: the child is
//! relaunched with exponential backoff while the rest of the pipeline keeps
//! running off the arena.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use frame_arena::FrameArena;
use kestrel_types::{CamName, FpsCounter, FrameNumber, UnixTime};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("decoder failed: {0}")]
    DecoderFailed(String),
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Restart backoff: 1s, 2s, 4s ... capped at 30s; reset after 10s healthy.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
const HEALTHY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub camera: CamName,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub decoder_bin: String,
    pub hwaccel_args: Vec<String>,
    pub input_args: Vec<String>,
    pub input_path: String,
    /// Per-camera segment cache for the record output, if recording is on.
    pub record_cache_dir: Option<std::path::PathBuf>,
    pub segment_duration: u32,
    /// Base restart delay; tests shrink this.
    pub backoff_base: Duration,
}

impl CaptureSettings {
    pub fn new(camera: CamName, width: u32, height: u32, fps: u32, input_path: String) -> Self {
        CaptureSettings {
            camera,
            width,
            height,
            fps,
            decoder_bin: "ffmpeg".to_string(),
            hwaccel_args: Vec::new(),
            input_args: Vec::new(),
            input_path,
            record_cache_dir: None,
            segment_duration: 10,
            backoff_base: BACKOFF_BASE,
        }
    }
}

/// Build the decoder argv: hwaccel and input args, one rawvideo pipe for
/// detection, and optionally a segmented copy output for recording.
pub fn build_decoder_args(settings: &CaptureSettings) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];
    args.extend(settings.hwaccel_args.iter().cloned());
    args.extend(settings.input_args.iter().cloned());
    args.push("-i".into());
    args.push(settings.input_path.clone());

    if let Some(cache_dir) = &settings.record_cache_dir {
        use rand::Rng;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let rand_tag: String = (0..6)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect();
        args.extend([
            "-c:v".into(),
            "copy".into(),
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            settings.segment_duration.to_string(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
            cache_dir
                .join(format!("%s-{rand_tag}.mp4"))
                .to_string_lossy()
                .into_owned(),
        ]);
    }

    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-s".into(),
        format!("{}x{}", settings.width, settings.height),
        "-r".into(),
        settings.fps.to_string(),
        "pipe:1".into(),
    ]);
    args
}

/// Anything that yields raw frames of a fixed byte size. The production
/// implementation wraps the decoder child's stdout; tests script their own.
pub trait FrameSource: Send {
    /// Fill `buf` with exactly one frame. An error ends this source; the
    /// worker restarts with a fresh one.
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<()>;

    /// OS pid, if this source is a child process.
    fn pid(&self) -> Option<u32> {
        None
    }
}

pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send>;

/// The decoder child process as a frame source.
pub struct DecoderChild {
    child: Child,
    stdout: std::process::ChildStdout,
}

impl DecoderChild {
    pub fn spawn(settings: &CaptureSettings) -> Result<DecoderChild> {
        let args = build_decoder_args(settings);
        debug!(camera = %settings.camera, "spawning decoder: {} {}", settings.decoder_bin, args.join(" "));
        let mut child = Command::new(&settings.decoder_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::DecoderFailed(format!("spawn: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::DecoderFailed("no stdout pipe".into()))?;

        // decoder chatter goes to our log, line by line
        if let Some(stderr) = child.stderr.take() {
            let camera = settings.camera.clone();
            std::thread::Builder::new()
                .name(format!("decoder-log-{camera}"))
                .spawn(move || {
                    use std::io::BufRead;
                    let reader = std::io::BufReader::new(stderr);
                    for line in reader.lines().map_while(|l| l.ok()) {
                        debug!(camera = %camera, "decoder: {line}");
                    }
                })
                .ok();
        }
        Ok(DecoderChild { child, stdout })
    }
}

impl FrameSource for DecoderChild {
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stdout
            .read_exact(buf)
            .map_err(|e| Error::DecoderFailed(format!("short read: {e}")))
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for DecoderChild {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Observable capture state for the watchdog and the stats snapshot.
#[derive(Clone)]
pub struct CaptureStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    pid: AtomicU32,
    last_frame_micros: AtomicI64,
    camera_fps_millis: AtomicU64,
    restarts: AtomicU64,
    frames: AtomicU64,
}

impl CaptureStatus {
    fn new() -> CaptureStatus {
        CaptureStatus {
            inner: Arc::new(StatusInner {
                pid: AtomicU32::new(0),
                last_frame_micros: AtomicI64::new(0),
                camera_fps_millis: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn last_frame(&self) -> Option<UnixTime> {
        match self.inner.last_frame_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(UnixTime::from_micros(micros)),
        }
    }

    pub fn camera_fps(&self) -> f64 {
        self.inner.camera_fps_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }
}

pub struct CaptureHandle {
    pub status: CaptureStatus,
    join: Option<std::thread::JoinHandle<()>>,
    restart_requested: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Force the current decoder down; the worker relaunches it (watchdog
    /// path).
    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Relaxed);
    }

    /// Shareable restart flag for a watchdog that outlives this handle.
    pub fn restart_flag(&self) -> Arc<AtomicBool> {
        self.restart_requested.clone()
    }

    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Start the capture worker thread for one camera.
///
/// `source_factory` produces the frame source; production passes a closure
/// spawning [`DecoderChild`], tests inject scripted sources.
pub fn spawn_capture_worker(
    settings: CaptureSettings,
    arena: Arc<FrameArena>,
    source_factory: SourceFactory,
    stop: Arc<AtomicBool>,
) -> CaptureHandle {
    let status = CaptureStatus::new();
    let restart_requested = Arc::new(AtomicBool::new(false));
    let worker_status = status.clone();
    let worker_restart = restart_requested.clone();
    let camera = settings.camera.clone();
    let join = std::thread::Builder::new()
        .name(format!("capture-{camera}"))
        .spawn(move || {
            run_capture(
                settings,
                arena,
                source_factory,
                stop,
                worker_status,
                worker_restart,
            )
        })
        .expect("spawn capture thread");
    CaptureHandle {
        status,
        join: Some(join),
        restart_requested,
    }
}

fn run_capture(
    settings: CaptureSettings,
    arena: Arc<FrameArena>,
    source_factory: SourceFactory,
    stop: Arc<AtomicBool>,
    status: CaptureStatus,
    restart_requested: Arc<AtomicBool>,
) {
    let frame_len = arena.frame_len();
    let mut sequence = FrameNumber(0);
    let mut backoff = settings.backoff_base;
    let mut fps = FpsCounter::default();

    while !stop.load(Ordering::Relaxed) {
        let mut source = match source_factory() {
            Ok(source) => source,
            Err(err) => {
                warn!(camera = %settings.camera, "decoder start failed: {err}");
                if sleep_interruptible(backoff, &stop) {
                    break;
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };
        status
            .inner
            .pid
            .store(source.pid().unwrap_or(0), Ordering::Relaxed);
        info!(camera = %settings.camera, pid = ?source.pid(), "decoder started");
        let started = Instant::now();

        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if restart_requested.swap(false, Ordering::Relaxed) {
                warn!(camera = %settings.camera, "watchdog requested decoder restart");
                break;
            }
            let mut slot = match arena.acquire_write(Duration::from_secs(1)) {
                Ok(slot) => slot,
                Err(frame_arena::Error::AcquireTimeout) => {
                    // all slots pinned by readers; keep the decoder draining
                    warn!(camera = %settings.camera, "no free frame slot for 1s");
                    continue;
                }
                Err(err) => {
                    error!(camera = %settings.camera, "arena failure: {err}");
                    return;
                }
            };
            debug_assert_eq!(slot.data_mut().len(), frame_len);
            match source.next_frame(slot.data_mut()) {
                Ok(()) => {
                    let now = UnixTime::now();
                    sequence = sequence.next();
                    slot.publish(sequence, now);
                    status
                        .inner
                        .last_frame_micros
                        .store(now.as_micros(), Ordering::Relaxed);
                    status.inner.frames.fetch_add(1, Ordering::Relaxed);
                    fps.update(now);
                    status
                        .inner
                        .camera_fps_millis
                        .store((fps.eps(now) * 1000.0) as u64, Ordering::Relaxed);
                    if started.elapsed() >= HEALTHY_AFTER {
                        backoff = settings.backoff_base;
                    }
                }
                Err(err) => {
                    // short read or EOF: the decoder is gone
                    warn!(camera = %settings.camera, "decoder read failed: {err}");
                    break;
                }
            }
        }

        drop(source);
        status.inner.pid.store(0, Ordering::Relaxed);
        if stop.load(Ordering::Relaxed) {
            break;
        }
        status.inner.restarts.fetch_add(1, Ordering::Relaxed);
        info!(
            camera = %settings.camera,
            "restarting decoder in {:.1}s",
            backoff.as_secs_f64()
        );
        if sleep_interruptible(backoff, &stop) {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    debug!(camera = %settings.camera, "capture worker stopped");
}

/// Sleep in small steps so shutdown stays prompt. Returns true if stopped.
fn sleep_interruptible(total: Duration, stop: &AtomicBool) -> bool {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
    stop.load(Ordering::Relaxed)
}
