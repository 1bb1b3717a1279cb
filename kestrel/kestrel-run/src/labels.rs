use std::collections::BTreeMap;
use std::path::Path;

use eyre::{Result, WrapErr};

/// The standard COCO label set most bundled detection models emit.
const DEFAULT_LABELS: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub fn default_labels() -> BTreeMap<u32, String> {
    DEFAULT_LABELS
        .iter()
        .enumerate()
        .map(|(i, l)| (i as u32, l.to_string()))
        .collect()
}

/// Load a label map file: either `index label` pairs or one label per line.
pub fn load_labels(path: &Path) -> Result<BTreeMap<u32, String>> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading label map {path:?}"))?;
    let mut labels = BTreeMap::new();
    let mut indexed = None;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let starts_with_index = line
            .split_whitespace()
            .next()
            .map(|tok| tok.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        let indexed = *indexed.get_or_insert(starts_with_index);
        if indexed {
            let (index, label) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| eyre::eyre!("bad label line {}: {line:?}", line_no + 1))?;
            labels.insert(index.parse::<u32>()?, label.trim().to_string());
        } else {
            labels.insert(labels.len() as u32, line.to_string());
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_labels() {
        let labels = default_labels();
        assert_eq!(labels.get(&0).map(String::as_str), Some("person"));
        assert_eq!(labels.get(&2).map(String::as_str), Some("car"));
        assert_eq!(labels.len(), 80);
    }

    #[test]
    fn test_load_plain_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "person\ncar\ndog\n").unwrap();
        let labels = load_labels(&path).unwrap();
        assert_eq!(labels.get(&1).map(String::as_str), Some("car"));
    }

    #[test]
    fn test_load_indexed_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "0 person\n5 bus\n17 dog\n").unwrap();
        let labels = load_labels(&path).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get(&17).map(String::as_str), Some("dog"));
    }
}
