use machine_vision_formats::{pixel_format::Mono8, ImageStride};

/// Bounding box of one connected component in a binary image, in the image's
/// own (typically downscaled) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentBox {
    pub x1: u32,
    pub y1: u32,
    /// Exclusive.
    pub x2: u32,
    pub y2: u32,
    /// Number of set pixels in the component.
    pub area: u32,
}

/// Extract bounding boxes of 8-connected components of nonzero pixels.
///
/// Components whose pixel count is `<= min_area` are discarded. Scanning is
/// iterative (explicit stack), so pathological blobs cannot overflow the call
/// stack.
pub fn component_boxes<IM>(im: &IM, min_area: u32) -> Vec<ComponentBox>
where
    IM: ImageStride<Mono8>,
{
    let w = im.width() as usize;
    let h = im.height() as usize;
    let stride = im.stride();
    let data = im.image_data();

    let mut visited = vec![false; w * h];
    let mut out = Vec::new();
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for sy in 0..h {
        for sx in 0..w {
            if visited[sy * w + sx] || data[sy * stride + sx] == 0 {
                continue;
            }
            let (mut x1, mut y1, mut x2, mut y2) = (sx, sy, sx, sy);
            let mut area = 0u32;
            visited[sy * w + sx] = true;
            stack.push((sx, sy));
            while let Some((x, y)) = stack.pop() {
                area += 1;
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x);
                y2 = y2.max(y);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as usize, ny as usize);
                        if !visited[ny * w + nx] && data[ny * stride + nx] != 0 {
                            visited[ny * w + nx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
            if area > min_area {
                out.push(ComponentBox {
                    x1: x1 as u32,
                    y1: y1 as u32,
                    x2: x2 as u32 + 1,
                    y2: y2 as u32 + 1,
                    area,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LumaImage;

    fn image_from_rows(rows: &[&[u8]]) -> LumaImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        let data: Vec<u8> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        LumaImage::new(w, h, w, data).unwrap()
    }

    #[test]
    fn test_empty_image_no_components() {
        let im = LumaImage::zeros(8, 8);
        assert!(component_boxes(&im, 0).is_empty());
    }

    #[test]
    fn test_two_separate_blobs() {
        let im = image_from_rows(&[
            &[255, 255, 0, 0, 0, 0],
            &[255, 255, 0, 0, 0, 0],
            &[0, 0, 0, 0, 0, 0],
            &[0, 0, 0, 0, 255, 0],
            &[0, 0, 0, 255, 255, 0],
        ]);
        let mut boxes = component_boxes(&im, 0);
        boxes.sort_by_key(|b| b.y1);
        assert_eq!(boxes.len(), 2);
        assert_eq!(
            boxes[0],
            ComponentBox {
                x1: 0,
                y1: 0,
                x2: 2,
                y2: 2,
                area: 4
            }
        );
        assert_eq!(
            boxes[1],
            ComponentBox {
                x1: 3,
                y1: 3,
                x2: 5,
                y2: 5,
                area: 3
            }
        );
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let im = image_from_rows(&[
            &[255, 0, 0],
            &[0, 255, 0],
            &[0, 0, 255],
        ]);
        let boxes = component_boxes(&im, 0);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].area, 3);
    }

    #[test]
    fn test_min_area_filters() {
        let im = image_from_rows(&[
            &[255, 255, 0, 0],
            &[255, 255, 0, 255],
        ]);
        let boxes = component_boxes(&im, 3);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].area, 4);
    }
}
