use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use memmap2::{MmapMut, MmapOptions};

use kestrel_types::{CamName, FrameNumber, UnixTime};

use crate::{frame_bytes, Error, Result};

const MAGIC: u64 = 0x4B_53_54_4C_41_52_4E_01; // "KSTLARN" + layout version

/// Size of the arena header (two cache lines).
const HEADER_BYTES: usize = 128;

/// Size of per-slot metadata (one cache line).
const SLOT_META_BYTES: usize = 64;

/// Header at the start of the arena mapping.
///
/// `#[repr(C)]` so external tooling can inspect a live arena file.
#[repr(C)]
struct ArenaHeader {
    magic: u64,
    slot_count: u32,
    width: u32,
    height: u32,
    _reserved: u32,
    /// Bytes from the start of one slot (its metadata) to the next.
    slot_stride: u64,
    _padding: [u8; 96],
}

const _: () = assert!(
    std::mem::size_of::<ArenaHeader>() == HEADER_BYTES,
    "ArenaHeader must be exactly HEADER_BYTES"
);

/// Metadata preceding each frame slot's pixel data.
#[repr(C)]
struct SlotMeta {
    sequence: AtomicU64,
    timestamp_micros: AtomicI64,
    /// Number of outstanding reader handles. The writer only receives a slot
    /// index through the free list, which happens exactly when this returns
    /// to zero.
    refcount: AtomicU32,
    _padding: [u8; 44],
}

const _: () = assert!(
    std::mem::size_of::<SlotMeta>() == SLOT_META_BYTES,
    "SlotMeta must be exactly SLOT_META_BYTES"
);

struct ConsumerHandle {
    name: String,
    tx: Sender<FrameRef>,
    /// Producer-side clone of the consumer's receiver, used to drop the
    /// oldest queued frame when the channel is full.
    rx: Receiver<FrameRef>,
    skipped: Arc<AtomicU64>,
}

/// A fixed pool of shared-memory frame slots for one camera.
///
/// Single writer (the capture worker), any number of registered consumers.
/// Publishing never blocks: when a consumer's channel is full, that
/// consumer's *oldest* queued frame is dropped and counted against it.
pub struct FrameArena {
    // mmap must be kept alive to maintain mapping validity
    #[allow(dead_code)]
    mmap: MmapMut,
    /// SAFETY: points to the start of the mapping, valid while `mmap` lives.
    header: *const ArenaHeader,
    /// SAFETY: points HEADER_BYTES into the mapping.
    base: *mut u8,
    camera: CamName,
    slot_count: usize,
    slot_stride: usize,
    frame_len: usize,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

// SAFETY: slot metadata is only touched through atomics; pixel data is
// written only while the slot index is held by the single writer (off the
// free list, refcount zero) and read only through published `FrameRef`s.
unsafe impl Send for FrameArena {}
unsafe impl Sync for FrameArena {}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("camera", &self.camera)
            .field("slot_count", &self.slot_count)
            .field("frame_len", &self.frame_len)
            .finish_non_exhaustive()
    }
}

impl FrameArena {
    /// Create (or overwrite) the arena file for one camera and map it.
    pub fn create(
        path: &Path,
        camera: CamName,
        width: u32,
        height: u32,
        slot_count: usize,
    ) -> Result<Arc<FrameArena>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let frame_len = frame_bytes(width, height);
        // keep each slot's pixel data cache-line aligned
        let slot_stride = (SLOT_META_BYTES + frame_len).next_multiple_of(64);
        let total = HEADER_BYTES + slot_count * slot_stride;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: the file was just sized to `total`, so mapping it
        // read-write is valid.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let header = mmap.as_mut_ptr() as *mut ArenaHeader;
        // SAFETY: the mapping is at least HEADER_BYTES long.
        unsafe {
            (*header).magic = MAGIC;
            (*header).slot_count = slot_count as u32;
            (*header).width = width;
            (*header).height = height;
            (*header)._reserved = 0;
            (*header).slot_stride = slot_stride as u64;
            (*header)._padding.fill(0);
        }
        // SAFETY: offset HEADER_BYTES is within the mapping.
        let base = unsafe { mmap.as_mut_ptr().add(HEADER_BYTES) };

        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        let arena = FrameArena {
            mmap,
            header,
            base,
            camera,
            slot_count,
            slot_stride,
            frame_len,
            free_tx: free_tx.clone(),
            free_rx,
            consumers: Mutex::new(Vec::new()),
        };
        for idx in 0..slot_count {
            let meta = arena.meta(idx);
            meta.sequence.store(0, Ordering::Relaxed);
            meta.timestamp_micros.store(0, Ordering::Relaxed);
            meta.refcount.store(0, Ordering::Relaxed);
            free_tx.send(idx).expect("own receiver alive");
        }
        Ok(Arc::new(arena))
    }

    fn meta(&self, idx: usize) -> &SlotMeta {
        debug_assert!(idx < self.slot_count);
        // SAFETY: idx < slot_count, so the slot start is within the mapping,
        // and SlotMeta is only accessed through its atomics.
        unsafe { &*(self.base.add(idx * self.slot_stride) as *const SlotMeta) }
    }

    fn frame_data(&self, idx: usize) -> &[u8] {
        // SAFETY: the frame region of slot `idx` lies inside the mapping.
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(idx * self.slot_stride + SLOT_META_BYTES),
                self.frame_len,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn frame_data_mut(&self, idx: usize) -> &mut [u8] {
        // SAFETY: only the writer calls this, only for a slot index it holds
        // exclusively (received from the free list and not yet published).
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(idx * self.slot_stride + SLOT_META_BYTES),
                self.frame_len,
            )
        }
    }

    pub fn camera(&self) -> &CamName {
        &self.camera
    }

    pub fn width(&self) -> u32 {
        // SAFETY: header points into the live mapping and is immutable after
        // creation.
        unsafe { (*self.header).width }
    }

    pub fn height(&self) -> u32 {
        // SAFETY: as in `width`.
        unsafe { (*self.header).height }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Number of slots currently available to the writer.
    pub fn free_slots(&self) -> usize {
        self.free_rx.len()
    }

    /// Register a consumer with a bounded queue. Must happen before capture
    /// starts so that refcounts stay consistent.
    pub fn register_consumer(&self, name: &str, capacity: usize) -> FrameReceiver {
        assert!(capacity >= 1, "consumer channel capacity must be >= 1");
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let skipped = Arc::new(AtomicU64::new(0));
        let mut consumers = self.consumers.lock().expect("consumers lock");
        consumers.push(ConsumerHandle {
            name: name.to_string(),
            tx,
            rx: rx.clone(),
            skipped: skipped.clone(),
        });
        FrameReceiver {
            name: name.to_string(),
            rx,
            skipped,
        }
    }

    /// Total frames dropped for one consumer because its queue was full.
    pub fn skipped_for(&self, name: &str) -> u64 {
        let consumers = self.consumers.lock().expect("consumers lock");
        consumers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.skipped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Block until a slot is free for writing. Live capture calls this with
    /// a timeout comfortably above the frame interval; hitting the timeout
    /// means every slot is pinned by readers.
    pub fn acquire_write(self: &Arc<Self>, timeout: Duration) -> Result<WriteSlot> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(idx) => {
                debug_assert_eq!(self.meta(idx).refcount.load(Ordering::Acquire), 0);
                Ok(WriteSlot {
                    arena: self.clone(),
                    idx,
                    published: false,
                })
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::AcquireTimeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    fn release(&self, idx: usize) {
        let prev = self.meta(idx).refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "frame slot refcount underflow");
        if prev == 1 {
            // last reader gone; hand the slot back to the writer
            let _ = self.free_tx.send(idx);
        }
    }
}

/// Exclusive handle to one slot while the capture worker fills it.
pub struct WriteSlot {
    arena: Arc<FrameArena>,
    idx: usize,
    published: bool,
}

impl WriteSlot {
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.arena.frame_data_mut(self.idx)
    }

    /// Publish the frame to every registered consumer.
    ///
    /// The refcount is set to the number of consumers before any channel
    /// send, so a racing release can never return the slot to the free list
    /// early. Full consumer channels drop their oldest queued frame, never
    /// the producer.
    pub fn publish(mut self, sequence: FrameNumber, timestamp: UnixTime) {
        self.published = true;
        let arena = self.arena.clone();
        let idx = self.idx;

        let meta = arena.meta(idx);
        meta.sequence.store(sequence.0, Ordering::Relaxed);
        meta.timestamp_micros
            .store(timestamp.as_micros(), Ordering::Relaxed);

        let consumers = arena.consumers.lock().expect("consumers lock");
        if consumers.is_empty() {
            let _ = arena.free_tx.send(idx);
            return;
        }
        meta.refcount
            .store(consumers.len() as u32, Ordering::Release);

        for consumer in consumers.iter() {
            let mut frame_ref = FrameRef {
                arena: arena.clone(),
                idx,
            };
            loop {
                match consumer.tx.try_send(frame_ref) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        frame_ref = back;
                        // drop the oldest queued frame, not the newest
                        match consumer.rx.try_recv() {
                            Ok(oldest) => {
                                drop(oldest);
                                consumer.skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                // consumer drained the queue between our
                                // failed send and now; just retry the send
                            }
                        }
                    }
                    Err(TrySendError::Disconnected(back)) => {
                        // receiver gone; drop our handle for this consumer
                        drop(back);
                        consumer.skipped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        if !self.published {
            // abandoned write (decoder died mid-frame); recycle the slot
            let _ = self.arena.free_tx.send(self.idx);
        }
    }
}

/// Refcounted read handle to one published frame.
pub struct FrameRef {
    arena: Arc<FrameArena>,
    idx: usize,
}

impl FrameRef {
    pub fn data(&self) -> &[u8] {
        self.arena.frame_data(self.idx)
    }

    pub fn sequence(&self) -> FrameNumber {
        FrameNumber(self.arena.meta(self.idx).sequence.load(Ordering::Relaxed))
    }

    pub fn timestamp(&self) -> UnixTime {
        UnixTime::from_micros(
            self.arena
                .meta(self.idx)
                .timestamp_micros
                .load(Ordering::Relaxed),
        )
    }

    pub fn camera(&self) -> &CamName {
        self.arena.camera()
    }
}

impl Clone for FrameRef {
    fn clone(&self) -> FrameRef {
        self.arena
            .meta(self.idx)
            .refcount
            .fetch_add(1, Ordering::AcqRel);
        FrameRef {
            arena: self.arena.clone(),
            idx: self.idx,
        }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        self.arena.release(self.idx);
    }
}

impl std::fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FrameRef {{ camera: {}, seq: {} }}",
            self.camera(),
            self.sequence()
        )
    }
}

/// Consumer end of a camera's frame stream.
pub struct FrameReceiver {
    name: String,
    rx: Receiver<FrameRef>,
    skipped: Arc<AtomicU64>,
}

impl FrameReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<FrameRef> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::AcquireTimeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Option<FrameRef> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames dropped for this consumer because its queue was full.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(slots: usize) -> (tempfile::TempDir, Arc<FrameArena>) {
        let dir = tempfile::tempdir().unwrap();
        let arena = FrameArena::create(
            &dir.path().join("frames"),
            CamName::new("test_cam"),
            64,
            48,
            slots,
        )
        .unwrap();
        (dir, arena)
    }

    fn publish_one(arena: &Arc<FrameArena>, seq: u64, fill: u8) {
        let mut slot = arena.acquire_write(Duration::from_secs(1)).unwrap();
        slot.data_mut().fill(fill);
        slot.publish(FrameNumber(seq), UnixTime(seq as f64));
    }

    #[test]
    fn test_publish_and_read_roundtrip() {
        let (_dir, arena) = test_arena(4);
        let rx = arena.register_consumer("motion", 4);

        publish_one(&arena, 7, 0xAB);

        let frame = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.sequence(), FrameNumber(7));
        assert_eq!(frame.timestamp(), UnixTime(7.0));
        assert_eq!(frame.data().len(), frame_bytes(64, 48));
        assert!(frame.data().iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_slot_not_reused_while_held() {
        let (_dir, arena) = test_arena(2);
        let rx = arena.register_consumer("motion", 2);

        publish_one(&arena, 1, 1);
        publish_one(&arena, 2, 2);
        let f1 = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let _f2 = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // both slots are held by readers: the writer must time out
        assert!(matches!(
            arena.acquire_write(Duration::from_millis(20)),
            Err(Error::AcquireTimeout)
        ));

        drop(f1);
        // releasing one frame frees exactly one slot
        let slot = arena.acquire_write(Duration::from_secs(1)).unwrap();
        drop(slot);
    }

    #[test]
    fn test_refcount_tracks_consumers_and_clones() {
        let (_dir, arena) = test_arena(2);
        let rx_a = arena.register_consumer("a", 2);
        let rx_b = arena.register_consumer("b", 2);

        publish_one(&arena, 1, 0);
        let fa = rx_a.recv_timeout(Duration::from_secs(1)).unwrap();
        let fb = rx_b.recv_timeout(Duration::from_secs(1)).unwrap();
        let fa2 = fa.clone();

        // one slot still free, the published one is pinned
        assert_eq!(arena.free_slots(), 1);
        drop(fa);
        drop(fb);
        assert_eq!(arena.free_slots(), 1);
        drop(fa2);
        assert_eq!(arena.free_slots(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let (_dir, arena) = test_arena(8);
        let capacity = 3;
        let rx = arena.register_consumer("slow", capacity);

        for seq in 0..100u64 {
            publish_one(&arena, seq, 0);
        }

        // exactly 100 - capacity frames were skipped for this consumer
        assert_eq!(rx.skipped(), 100 - capacity as u64);
        assert_eq!(arena.skipped_for("slow"), 100 - capacity as u64);

        // and the survivors are the newest ones, in order
        let kept: Vec<u64> = std::iter::from_fn(|| rx.try_recv())
            .map(|f| f.sequence().0)
            .collect();
        assert_eq!(kept, vec![97, 98, 99]);
    }

    #[test]
    fn test_consumer_sees_monotonic_sequences() {
        let (_dir, arena) = test_arena(4);
        let rx = arena.register_consumer("motion", 2);

        let publisher = {
            let arena = arena.clone();
            std::thread::spawn(move || {
                for seq in 1..=50u64 {
                    publish_one(&arena, seq, 0);
                }
            })
        };

        let mut last = 0u64;
        let mut seen = 0usize;
        while let Ok(frame) = rx.recv_timeout(Duration::from_millis(200)) {
            let seq = frame.sequence().0;
            assert!(seq > last, "sequence went backwards: {last} -> {seq}");
            last = seq;
            seen += 1;
        }
        publisher.join().unwrap();
        assert!(seen >= 1);
        assert_eq!(seen as u64 + rx.skipped(), 50);
    }

    #[test]
    fn test_abandoned_write_recycles_slot() {
        let (_dir, arena) = test_arena(2);
        let _rx = arena.register_consumer("motion", 2);
        {
            let mut slot = arena.acquire_write(Duration::from_secs(1)).unwrap();
            slot.data_mut()[0] = 1;
            // dropped without publish
        }
        assert_eq!(arena.free_slots(), 2);
    }

    #[test]
    fn test_publish_without_consumers_recycles() {
        let (_dir, arena) = test_arena(2);
        for seq in 0..10 {
            publish_one(&arena, seq, 0);
        }
        assert_eq!(arena.free_slots(), 2);
    }
}
