use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use frame_arena::{
    detection_input_path, detection_result_path, DetectionInputSlot, DetectionResultSlot,
};
use kestrel_types::{CamName, DetectionRow, FrameNumber, SquareRegion, UnixTime};

use crate::backend::{AccelBackend, BackendError};
use crate::postprocess::PostProcess;
use crate::DetectError;

/// Builds a fresh backend; called at spawn and again on worker restart.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn AccelBackend>, BackendError> + Send>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub shm_dir: PathBuf,
    pub input_side: u32,
    pub postprocess: PostProcess,
}

/// A completed detection for one camera request.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub rows: Vec<DetectionRow>,
}

struct DetectionRequest {
    camera: CamName,
    sequence: FrameNumber,
    region: SquareRegion,
    attempts: u32,
    reply: Sender<Result<DetectionOutcome, DetectError>>,
}

enum Job {
    Detect(DetectionRequest),
    Stop,
}

enum WorkerEvent {
    Idle {
        worker: usize,
        generation: u64,
    },
    Failed {
        worker: usize,
        generation: u64,
        request: DetectionRequest,
        fatal: bool,
    },
}

enum Control {
    RestartWorker(usize),
    Shutdown,
}

/// Per-worker data the watchdog can observe.
#[derive(Clone)]
pub struct WorkerInfo {
    pub name: String,
    last_inference_micros: Arc<AtomicI64>,
}

impl WorkerInfo {
    /// Completion time of the worker's most recent inference, if any.
    pub fn last_inference(&self) -> Option<UnixTime> {
        match self.last_inference_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(UnixTime::from_micros(micros)),
        }
    }
}

struct WorkerSlot {
    name: String,
    tx: Sender<Job>,
    generation: u64,
    alive: bool,
    busy: bool,
    info: WorkerInfo,
    join: Option<std::thread::JoinHandle<()>>,
}

/// Handle to the shared detector subsystem.
pub struct DetectorPool {
    requests_tx: Sender<DetectionRequest>,
    control_tx: Sender<Control>,
    infos: Vec<WorkerInfo>,
    arbiter: Option<std::thread::JoinHandle<()>>,
}

impl DetectorPool {
    /// Spawn the arbiter and one worker per factory. Factories that fail at
    /// startup are logged and skipped; at least one worker must load.
    pub fn spawn(
        factories: Vec<(String, BackendFactory)>,
        settings: PoolSettings,
    ) -> Result<DetectorPool, BackendError> {
        let worker_count = factories.len();
        // bounded queue keeps end-to-end latency predictable
        let (requests_tx, requests_rx) = crossbeam_channel::bounded(worker_count * 2);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let mut slots = Vec::new();
        let mut infos = Vec::new();
        let mut stored_factories = Vec::new();
        for (idx, (name, factory)) in factories.into_iter().enumerate() {
            let info = WorkerInfo {
                name: name.clone(),
                last_inference_micros: Arc::new(AtomicI64::new(0)),
            };
            let started = match factory() {
                Ok(backend) => {
                    info!(worker = %name, "detector loaded: {}", backend.name());
                    Some(spawn_worker(
                        idx,
                        0,
                        backend,
                        &settings,
                        events_tx.clone(),
                        info.clone(),
                    ))
                }
                Err(err) => {
                    error!(worker = %name, "detector failed to load: {err}");
                    None
                }
            };
            let (tx, alive, join) = match started {
                Some((tx, join)) => (tx, true, Some(join)),
                None => {
                    // dead placeholder keeps worker indices stable
                    let (tx, _rx) = crossbeam_channel::bounded(1);
                    (tx, false, None)
                }
            };
            slots.push(WorkerSlot {
                name: name.clone(),
                tx,
                generation: 0,
                alive,
                busy: false,
                info: info.clone(),
                join,
            });
            infos.push(info);
            stored_factories.push((name, factory));
        }

        if !slots.iter().any(|s| s.alive) {
            return Err(BackendError::ModelLoadFailed(
                "no detector worker could be started".to_string(),
            ));
        }

        let settings_for_arbiter = settings.clone();
        let arbiter = std::thread::Builder::new()
            .name("detect-arbiter".to_string())
            .spawn(move || {
                run_arbiter(
                    slots,
                    stored_factories,
                    settings_for_arbiter,
                    requests_rx,
                    events_rx,
                    events_tx,
                    control_rx,
                )
            })
            .expect("spawn arbiter thread");

        Ok(DetectorPool {
            requests_tx,
            control_tx,
            infos,
            arbiter: Some(arbiter),
        })
    }

    /// Submit a request without waiting; returns the reply receiver.
    pub fn try_request(
        &self,
        camera: &CamName,
        sequence: FrameNumber,
        region: SquareRegion,
    ) -> Result<Receiver<Result<DetectionOutcome, DetectError>>, DetectError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let request = DetectionRequest {
            camera: camera.clone(),
            sequence,
            region,
            attempts: 0,
            reply: reply_tx,
        };
        match self.requests_tx.try_send(request) {
            Ok(()) => Ok(reply_rx),
            Err(TrySendError::Full(_)) => Err(DetectError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DetectError::ShutDown),
        }
    }

    /// Submit and wait for the result with a deadline.
    pub fn request_blocking(
        &self,
        camera: &CamName,
        sequence: FrameNumber,
        region: SquareRegion,
        timeout: Duration,
    ) -> Result<DetectionOutcome, DetectError> {
        let reply_rx = self.try_request(camera, sequence, region)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(DetectError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(DetectError::ShutDown),
        }
    }

    pub fn worker_infos(&self) -> &[WorkerInfo] {
        &self.infos
    }

    /// Ask the arbiter to replace a worker (watchdog path).
    pub fn restart_worker(&self, index: usize) {
        let _ = self.control_tx.send(Control::RestartWorker(index));
    }

    pub fn shutdown(self) {
        // Drop runs the shutdown handshake.
    }
}

impl Drop for DetectorPool {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
        if let Some(join) = self.arbiter.take() {
            let _ = join.join();
        }
    }
}

fn spawn_worker(
    index: usize,
    generation: u64,
    backend: Box<dyn AccelBackend>,
    settings: &PoolSettings,
    events_tx: Sender<WorkerEvent>,
    info: WorkerInfo,
) -> (Sender<Job>, std::thread::JoinHandle<()>) {
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
    let settings = settings.clone();
    let join = std::thread::Builder::new()
        .name(format!("accel-{}", info.name))
        .spawn(move || run_worker(index, generation, backend, settings, job_rx, events_tx, info))
        .expect("spawn accel worker thread");
    (job_tx, join)
}

fn run_worker(
    index: usize,
    generation: u64,
    mut backend: Box<dyn AccelBackend>,
    settings: PoolSettings,
    job_rx: Receiver<Job>,
    events_tx: Sender<WorkerEvent>,
    info: WorkerInfo,
) {
    // per-camera shared-memory slots, opened on first request
    let mut slots: HashMap<CamName, (DetectionInputSlot, DetectionResultSlot)> = HashMap::new();

    while let Ok(job) = job_rx.recv() {
        let request = match job {
            Job::Detect(request) => request,
            Job::Stop => break,
        };
        let camera = request.camera.clone();

        if !slots.contains_key(&camera) {
            let input = DetectionInputSlot::open(
                &detection_input_path(&settings.shm_dir, camera.as_str()),
                settings.input_side,
            );
            let result = DetectionResultSlot::open(&detection_result_path(
                &settings.shm_dir,
                camera.as_str(),
            ));
            match (input, result) {
                (Ok(input), Ok(result)) => {
                    slots.insert(camera.clone(), (input, result));
                }
                (input, result) => {
                    warn!(
                        worker = %info.name,
                        camera = %camera,
                        "cannot open detection slots: {:?} {:?}",
                        input.err(),
                        result.err()
                    );
                    let _ = events_tx.send(WorkerEvent::Failed {
                        worker: index,
                        generation,
                        request,
                        fatal: false,
                    });
                    let _ = events_tx.send(WorkerEvent::Idle {
                        worker: index,
                        generation,
                    });
                    continue;
                }
            }
        }
        let (input, result) = slots.get_mut(&camera).expect("slot just inserted");

        let tensor = input.tensor().to_vec();
        match backend.detect(&tensor) {
            Ok(output) => {
                let rows = settings.postprocess.rows(output);
                result.write_rows(&rows);
                info.last_inference_micros
                    .store(UnixTime::now().as_micros(), Ordering::Relaxed);
                let _ = request.reply.send(Ok(DetectionOutcome { rows }));
                let _ = events_tx.send(WorkerEvent::Idle {
                    worker: index,
                    generation,
                });
            }
            Err(BackendError::InferenceFailed(msg)) => {
                warn!(worker = %info.name, camera = %camera, "inference failed: {msg}");
                let _ = events_tx.send(WorkerEvent::Failed {
                    worker: index,
                    generation,
                    request,
                    fatal: false,
                });
                let _ = events_tx.send(WorkerEvent::Idle {
                    worker: index,
                    generation,
                });
            }
            Err(BackendError::ModelLoadFailed(msg)) => {
                error!(worker = %info.name, "model failure, worker exiting: {msg}");
                let _ = events_tx.send(WorkerEvent::Failed {
                    worker: index,
                    generation,
                    request,
                    fatal: true,
                });
                return;
            }
        }
    }
    debug!(worker = %info.name, "accel worker stopped");
}

fn handle_event(
    slots: &mut [WorkerSlot],
    idle: &mut VecDeque<usize>,
    requeued: &mut VecDeque<DetectionRequest>,
    event: WorkerEvent,
) {
    match event {
        WorkerEvent::Idle { worker, generation } => {
            let slot = &mut slots[worker];
            if slot.generation == generation && slot.alive && slot.busy {
                slot.busy = false;
                idle.push_back(worker);
            }
        }
        WorkerEvent::Failed {
            worker,
            generation,
            mut request,
            fatal,
        } => {
            let slot = &mut slots[worker];
            if fatal && slot.generation == generation {
                slot.alive = false;
                slot.busy = false;
                error!(worker = %slot.name, "removed from rotation after model failure");
            }
            if request.attempts == 0 {
                request.attempts = 1;
                // retried requests go to the head of the line
                requeued.push_front(request);
            } else {
                debug!(camera = %request.camera, "request failed twice, giving up");
                let _ = request.reply.send(Err(DetectError::Unavailable));
            }
        }
    }
}

fn dispatch(
    slots: &mut [WorkerSlot],
    idle: &mut VecDeque<usize>,
    requeued: &mut VecDeque<DetectionRequest>,
    request: DetectionRequest,
) {
    let Some(worker) = idle.pop_front() else {
        requeued.push_back(request);
        return;
    };
    let slot = &mut slots[worker];
    debug!(
        worker = %slot.name,
        camera = %request.camera,
        sequence = %request.sequence,
        region = ?request.region,
        "dispatching detection request"
    );
    slot.busy = true;
    if let Err(err) = slot.tx.send(Job::Detect(request)) {
        // worker channel closed underneath us (fatal exit raced its event)
        slot.alive = false;
        slot.busy = false;
        if let Job::Detect(request) = err.into_inner() {
            requeued.push_back(request);
        }
    }
}

fn restart_worker(
    slots: &mut [WorkerSlot],
    factories: &[(String, BackendFactory)],
    settings: &PoolSettings,
    events_tx: &Sender<WorkerEvent>,
    index: usize,
) {
    let Some(slot) = slots.get_mut(index) else {
        warn!("restart requested for unknown worker {index}");
        return;
    };
    info!(worker = %slot.name, "restarting accel worker");
    let _ = slot.tx.send(Job::Stop);
    let (_, factory) = &factories[index];
    match factory() {
        Ok(backend) => {
            slot.generation += 1;
            let (tx, join) = spawn_worker(
                index,
                slot.generation,
                backend,
                settings,
                events_tx.clone(),
                slot.info.clone(),
            );
            slot.tx = tx;
            slot.join = Some(join);
            slot.alive = true;
            slot.busy = false;
        }
        Err(err) => {
            error!(worker = %slot.name, "restart failed: {err}");
            slot.alive = false;
        }
    }
}

fn run_arbiter(
    mut slots: Vec<WorkerSlot>,
    factories: Vec<(String, BackendFactory)>,
    settings: PoolSettings,
    requests_rx: Receiver<DetectionRequest>,
    events_rx: Receiver<WorkerEvent>,
    events_tx: Sender<WorkerEvent>,
    control_rx: Receiver<Control>,
) {
    let mut idle: VecDeque<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.alive)
        .map(|(i, _)| i)
        .collect();
    let mut requeued: VecDeque<DetectionRequest> = VecDeque::new();

    loop {
        // opportunistically drain completion events before deciding
        while let Ok(event) = events_rx.try_recv() {
            handle_event(&mut slots, &mut idle, &mut requeued, event);
        }
        idle.retain(|i| slots[*i].alive);

        let no_workers = slots.iter().all(|s| !s.alive);
        if no_workers {
            for request in requeued.drain(..) {
                let _ = request.reply.send(Err(DetectError::Unavailable));
            }
        }

        if !idle.is_empty() {
            if let Some(request) = requeued.pop_front() {
                dispatch(&mut slots, &mut idle, &mut requeued, request);
                continue;
            }
        }

        if !idle.is_empty() || no_workers {
            crossbeam_channel::select! {
                recv(requests_rx) -> msg => match msg {
                    Ok(request) => {
                        if no_workers {
                            let _ = request.reply.send(Err(DetectError::Unavailable));
                        } else {
                            dispatch(&mut slots, &mut idle, &mut requeued, request);
                        }
                    }
                    Err(_) => break, // all request senders dropped
                },
                recv(events_rx) -> msg => {
                    if let Ok(event) = msg {
                        handle_event(&mut slots, &mut idle, &mut requeued, event);
                    }
                }
                recv(control_rx) -> msg => match msg {
                    Ok(Control::RestartWorker(index)) => {
                        restart_worker(&mut slots, &factories, &settings, &events_tx, index);
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                },
            }
        } else {
            // every worker busy: leave requests in the bounded queue so the
            // queue-length bound (and planner-side skipping) holds
            crossbeam_channel::select! {
                recv(events_rx) -> msg => {
                    if let Ok(event) = msg {
                        handle_event(&mut slots, &mut idle, &mut requeued, event);
                    }
                }
                recv(control_rx) -> msg => match msg {
                    Ok(Control::RestartWorker(index)) => {
                        restart_worker(&mut slots, &factories, &settings, &events_tx, index);
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                },
            }
        }
    }

    // shutdown: stop workers, fail whatever is still queued
    for slot in &slots {
        if slot.alive {
            let _ = slot.tx.send(Job::Stop);
        }
    }
    for request in requeued {
        let _ = request.reply.send(Err(DetectError::ShutDown));
    }
    while let Ok(request) = requests_rx.try_recv() {
        let _ = request.reply.send(Err(DetectError::ShutDown));
    }
    for slot in &mut slots {
        if let Some(join) = slot.join.take() {
            let _ = join.join();
        }
    }
    debug!("detector arbiter stopped");
}
