use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use kestrel_types::{DetectionRow, DETECTION_TABLE_BYTES, MAX_DETECTIONS};

use crate::{Error, Result};

fn map_slot(path: &Path, expected: usize, create: bool) -> Result<MmapMut> {
    if create {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)?;
    if create {
        file.set_len(expected as u64)?;
    } else {
        let actual = file.metadata()?.len();
        if actual != expected as u64 {
            return Err(Error::SlotSize {
                path: path.to_path_buf(),
                expected: expected as u64,
                actual,
            });
        }
    }
    // SAFETY: the file length was just set (or verified) to `expected`.
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// The camera's model-input tensor slot: `side * side * 3` bytes, u8 HWC.
///
/// Written by the region planner, read by the accelerator worker that picked
/// up the camera's request. Exactly one detection request per camera is
/// outstanding at a time, so no further synchronization is needed on the
/// pixel payload itself.
pub struct DetectionInputSlot {
    mmap: MmapMut,
    side: usize,
}

impl DetectionInputSlot {
    pub fn create(path: &Path, side: u32) -> Result<Self> {
        let side = side as usize;
        let mmap = map_slot(path, side * side * 3, true)?;
        Ok(DetectionInputSlot { mmap, side })
    }

    /// Attach to an existing slot (the worker side).
    pub fn open(path: &Path, side: u32) -> Result<Self> {
        let side = side as usize;
        let mmap = map_slot(path, side * side * 3, false)?;
        Ok(DetectionInputSlot { mmap, side })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn tensor(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn tensor_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }
}

/// The camera's detection result slot: a fixed 20x6 float32 table, rows
/// `[class, score, y1, x1, y2, x2]` in normalized region coordinates.
pub struct DetectionResultSlot {
    mmap: MmapMut,
}

impl DetectionResultSlot {
    pub fn create(path: &Path) -> Result<Self> {
        let mmap = map_slot(path, DETECTION_TABLE_BYTES, true)?;
        Ok(DetectionResultSlot { mmap })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mmap = map_slot(path, DETECTION_TABLE_BYTES, false)?;
        Ok(DetectionResultSlot { mmap })
    }

    /// Write up to [`MAX_DETECTIONS`] rows; remaining rows are zeroed.
    pub fn write_rows(&mut self, rows: &[DetectionRow]) {
        let count = rows.len().min(MAX_DETECTIONS);
        let buf = &mut self.mmap[..];
        buf.fill(0);
        for (i, row) in rows[..count].iter().enumerate() {
            let vals = [
                row.class_id as f32,
                row.score,
                row.y1,
                row.x1,
                row.y2,
                row.x2,
            ];
            for (j, v) in vals.iter().enumerate() {
                let off = (i * 6 + j) * 4;
                buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
    }

    /// Read rows until the first empty (zero-score) row.
    pub fn read_rows(&self) -> Vec<DetectionRow> {
        let buf = &self.mmap[..];
        let mut out = Vec::new();
        for i in 0..MAX_DETECTIONS {
            let at = |j: usize| -> f32 {
                let off = (i * 6 + j) * 4;
                f32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes"))
            };
            let row = DetectionRow {
                class_id: at(0) as u32,
                score: at(1),
                y1: at(2),
                x1: at(3),
                y2: at(4),
                x2: at(5),
            };
            if row.is_empty() {
                break;
            }
            out.push(row);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{detection_input_path, detection_result_path};

    #[test]
    fn test_input_slot_shared_between_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = detection_input_path(dir.path(), "front");
        let mut writer = DetectionInputSlot::create(&path, 32).unwrap();
        let reader = DetectionInputSlot::open(&path, 32).unwrap();

        writer.tensor_mut()[0] = 42;
        writer.tensor_mut()[32 * 32 * 3 - 1] = 7;
        assert_eq!(reader.tensor()[0], 42);
        assert_eq!(reader.tensor()[32 * 32 * 3 - 1], 7);
    }

    #[test]
    fn test_open_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = detection_input_path(dir.path(), "front");
        DetectionInputSlot::create(&path, 32).unwrap();
        assert!(matches!(
            DetectionInputSlot::open(&path, 64),
            Err(Error::SlotSize { .. })
        ));
    }

    #[test]
    fn test_result_rows_roundtrip_and_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = detection_result_path(dir.path(), "front");
        let mut slot = DetectionResultSlot::create(&path).unwrap();

        let rows = vec![
            DetectionRow {
                class_id: 1,
                score: 0.9,
                y1: 0.1,
                x1: 0.2,
                y2: 0.3,
                x2: 0.4,
            },
            DetectionRow {
                class_id: 17,
                score: 0.55,
                y1: 0.5,
                x1: 0.6,
                y2: 0.7,
                x2: 0.8,
            },
        ];
        slot.write_rows(&rows);

        let reader = DetectionResultSlot::open(&path).unwrap();
        assert_eq!(reader.read_rows(), rows);

        // rewriting with fewer rows must clear the rest
        slot.write_rows(&rows[..1]);
        assert_eq!(reader.read_rows(), rows[..1]);
    }

    #[test]
    fn test_result_rows_capped_at_table_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut slot = DetectionResultSlot::create(&path).unwrap();
        let many: Vec<DetectionRow> = (0..30)
            .map(|i| DetectionRow {
                class_id: i,
                score: 0.5,
                y1: 0.0,
                x1: 0.0,
                y2: 1.0,
                x2: 1.0,
            })
            .collect();
        slot.write_rows(&many);
        assert_eq!(slot.read_rows().len(), MAX_DETECTIONS);
    }
}
