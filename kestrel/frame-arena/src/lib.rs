//! Shared-memory frame transport.
//!
//! Each camera owns one memory-mapped arena holding a fixed number of raw
//! frame slots, plus one detection input slot and one detection result slot.
//! The capture worker is the single writer; motion/tracking consumers hold
//! published frames through refcounted [`FrameRef`] handles. A slot index is
//! only handed back to the writer once its refcount returns to zero, so a
//! slot can never be overwritten while a reader holds it.

use std::path::{Path, PathBuf};

mod arena;
mod slots;

pub use arena::{FrameArena, FrameReceiver, FrameRef, WriteSlot};
pub use slots::{DetectionInputSlot, DetectionResultSlot};

/// Shared memory reserved for everything that is not frame slots.
pub const SHM_RESERVED_BYTES: u64 = 50 * 1024 * 1024;

/// Additional reservation when the mosaic output stream is enabled.
pub const SHM_MOSAIC_BYTES: u64 = 8 * 1024 * 1024;

/// Fixed per-slot metadata overhead budgeted into the sizing formula.
pub const SLOT_OVERHEAD_BYTES: u64 = 264 * 1024;

/// Hard cap on slots per camera.
pub const MAX_SLOTS_PER_CAMERA: usize = 50;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error(
        "shared memory exhausted: budget of {available} bytes yields {slots} \
         frame slots for {width}x{height}, need at least 2"
    )]
    SharedMemoryExhausted {
        available: u64,
        slots: usize,
        width: u32,
        height: u32,
    },
    #[error("detection slot {path} has size {actual}, expected {expected}")]
    SlotSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("timed out waiting for a free frame slot")]
    AcquireTimeout,
    #[error("arena is shut down")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bytes of one raw YUV 4:2:0 frame.
pub const fn frame_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

/// Number of frame slots per camera for a given shared-memory budget.
///
/// `available = total − reserved (50 MiB, + 8 MiB with mosaic output)`;
/// `slots = min(50, available / (1.5·W·H + 264 KiB))`. Returns
/// [`Error::SharedMemoryExhausted`] below 2 slots and logs a warning below
/// 10.
pub fn slots_for_budget(
    total_shm: u64,
    mosaic_output: bool,
    width: u32,
    height: u32,
) -> Result<usize> {
    let mut reserved = SHM_RESERVED_BYTES;
    if mosaic_output {
        reserved += SHM_MOSAIC_BYTES;
    }
    let available = total_shm.saturating_sub(reserved);
    let per_slot = frame_bytes(width, height) as u64 + SLOT_OVERHEAD_BYTES;
    let slots = ((available / per_slot) as usize).min(MAX_SLOTS_PER_CAMERA);
    if slots < 2 {
        return Err(Error::SharedMemoryExhausted {
            available,
            slots,
            width,
            height,
        });
    }
    if slots < 10 {
        tracing::warn!(
            "shared memory budget yields only {slots} frame slots for \
             {width}x{height}; expect frame drops under load"
        );
    }
    Ok(slots)
}

/// Path of a camera's detection input slot below the shm root.
pub fn detection_input_path(shm_dir: &Path, camera: &str) -> PathBuf {
    shm_dir.join("cam").join(camera).join("in")
}

/// Path of a camera's detection result slot below the shm root.
pub fn detection_result_path(shm_dir: &Path, camera: &str) -> PathBuf {
    shm_dir.join("cam").join(camera).join("out")
}

/// Path of a camera's frame arena below the shm root.
pub fn arena_path(shm_dir: &Path, camera: &str) -> PathBuf {
    shm_dir.join("cam").join(camera).join("frames")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_for_budget_caps_at_50() {
        // plenty of memory: the cap applies
        let slots = slots_for_budget(64 * 1024 * 1024 * 1024, false, 1280, 720).unwrap();
        assert_eq!(slots, 50);
    }

    #[test]
    fn test_slots_for_budget_formula() {
        // 1 GiB total, 1920x1080: available = 1 GiB - 50 MiB,
        // per-slot = 1920*1080*1.5 + 264 KiB = 3_110_400 + 270_336
        let total = 1024 * 1024 * 1024u64;
        let available = total - SHM_RESERVED_BYTES;
        let per_slot = 3_110_400u64 + 270_336;
        let expect = (available / per_slot) as usize;
        assert!(expect < 50);
        assert_eq!(slots_for_budget(total, false, 1920, 1080).unwrap(), expect);
    }

    #[test]
    fn test_mosaic_output_reserves_more() {
        let total = SHM_RESERVED_BYTES + SHM_MOSAIC_BYTES + 4 * (3_110_400 + 270_336);
        let without = slots_for_budget(total, false, 1920, 1080).unwrap();
        let with = slots_for_budget(total, true, 1920, 1080).unwrap();
        // the 8 MiB mosaic reservation costs two 1080p slots here
        assert_eq!(without, 6);
        assert_eq!(with, 4);
    }

    #[test]
    fn test_too_little_memory_is_fatal() {
        let err = slots_for_budget(SHM_RESERVED_BYTES + 1024, false, 1920, 1080).unwrap_err();
        assert!(matches!(err, Error::SharedMemoryExhausted { .. }));
    }
}
