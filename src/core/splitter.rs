use image::RgbImage;

use crate::core::GPU_MAX_PIXELS;
use crate::error::UpscaleError;

/// A rectangular sub-region of the original image. Coordinates stay in
/// ORIGINAL pre-upscale pixels for the whole life of a tile, across every
/// stage and split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub col: u32,
    pub row: u32,
}

impl TileRegion {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// A tile feathers on an edge iff its region starts past the image origin
    /// on that axis; boundary tiles carry no overlap there.
    pub fn feathers_left(&self) -> bool {
        self.x > 0
    }

    pub fn feathers_top(&self) -> bool {
        self.y > 0
    }
}

/// Slice an image extent into a cols x rows grid of regions, each sized
/// `ceil(dim/grid)` plus `overlap` extended onto internal edges only. The
/// union of regions covers the extent exactly.
pub fn grid_regions(width: u32, height: u32, cols: u32, rows: u32, overlap: u32) -> Vec<TileRegion> {
    let base_w = width.div_ceil(cols);
    let base_h = height.div_ceil(rows);
    let mut regions = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x0 = col * base_w;
            let y0 = row * base_h;
            let x1 = ((col + 1) * base_w).min(width);
            let y1 = ((row + 1) * base_h).min(height);
            let x = if col > 0 { x0.saturating_sub(overlap) } else { x0 };
            let y = if row > 0 { y0.saturating_sub(overlap) } else { y0 };
            regions.push(TileRegion {
                x,
                y,
                width: x1 - x,
                height: y1 - y,
                col,
                row,
            });
        }
    }
    regions
}

/// Crop one region out of the source image (initial, stage-1 split).
pub fn crop_tile(img: &RgbImage, region: &TileRegion) -> Result<RgbImage, UpscaleError> {
    if region.x + region.width > img.width() || region.y + region.height > img.height() {
        return Err(UpscaleError::Decode(format!(
            "tile region {},{} {}x{} exceeds image {}x{}",
            region.x,
            region.y,
            region.width,
            region.height,
            img.width(),
            img.height()
        )));
    }
    Ok(image::imageops::crop_imm(img, region.x, region.y, region.width, region.height).to_image())
}

/// Grid side for a split factor: `ceil(sqrt(k))`.
pub fn split_grid(split_from_previous: u32) -> u32 {
    (split_from_previous as f64).sqrt().ceil() as u32
}

/// Sub-regions a parent tile becomes under a `split_from_previous` factor.
/// Children partition the parent's region, with `overlap` extended across
/// sibling-internal edges; edges the parent already shares with its neighbors
/// keep the parent's existing overlap.
pub fn child_regions(parent: &TileRegion, split_from_previous: u32, overlap: u32) -> Vec<TileRegion> {
    let g = split_grid(split_from_previous);
    let base_w = parent.width.div_ceil(g);
    let base_h = parent.height.div_ceil(g);
    let mut children = Vec::with_capacity((g * g) as usize);
    for cy in 0..g {
        for cx in 0..g {
            let x0 = parent.x + cx * base_w;
            let y0 = parent.y + cy * base_h;
            let x1 = (parent.x + (cx + 1) * base_w).min(parent.x + parent.width);
            let y1 = (parent.y + (cy + 1) * base_h).min(parent.y + parent.height);
            let x = if cx > 0 { x0.saturating_sub(overlap).max(parent.x) } else { x0 };
            let y = if cy > 0 { y0.saturating_sub(overlap).max(parent.y) } else { y0 };
            children.push(TileRegion {
                x,
                y,
                width: x1 - x,
                height: y1 - y,
                col: cx,
                row: cy,
            });
        }
    }
    children
}

/// Crop a child's pixels out of the parent's CURRENT stage output. The child
/// region is mapped through the ratio of the parent's current pixel size to
/// its original-coordinate size, so child coordinates remain original-space.
pub fn crop_child(
    parent_img: &RgbImage,
    parent: &TileRegion,
    child: &TileRegion,
) -> Result<RgbImage, UpscaleError> {
    if parent.width == 0 || parent.height == 0 {
        return Err(UpscaleError::Decode("parent region has zero extent".into()));
    }
    let rx = parent_img.width() as f64 / parent.width as f64;
    let ry = parent_img.height() as f64 / parent.height as f64;
    let px = ((child.x - parent.x) as f64 * rx).round() as u32;
    let py = ((child.y - parent.y) as f64 * ry).round() as u32;
    let pw = ((child.width as f64 * rx).round() as u32).min(parent_img.width() - px.min(parent_img.width()));
    let ph = ((child.height as f64 * ry).round() as u32).min(parent_img.height() - py.min(parent_img.height()));
    if pw == 0 || ph == 0 || px >= parent_img.width() || py >= parent_img.height() {
        return Err(UpscaleError::Decode(format!(
            "child crop {},{} {}x{} falls outside parent output {}x{}",
            px,
            py,
            pw,
            ph,
            parent_img.width(),
            parent_img.height()
        )));
    }
    Ok(image::imageops::crop_imm(parent_img, px, py, pw, ph).to_image())
}

/// Degraded path when the stage plan is unavailable at split time: derive the
/// split factor from the observed output size and the upcoming multiplier.
pub fn derive_split_from_overflow(out_w: u32, out_h: u32, next_multiplier: u32) -> u32 {
    let projected =
        out_w as u64 * out_h as u64 * (next_multiplier as u64) * (next_multiplier as u64);
    if projected <= GPU_MAX_PIXELS {
        return 1;
    }
    let ratio = projected as f64 / GPU_MAX_PIXELS as f64;
    let g = ratio.sqrt().ceil() as u32;
    g * g
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every pixel covered at least once; pixels outside any overlap band
    /// covered exactly once.
    fn assert_exact_coverage(regions: &[TileRegion], width: u32, height: u32, overlap: u32) {
        let mut counts = vec![0u8; (width * height) as usize];
        for r in regions {
            assert!(r.x + r.width <= width && r.y + r.height <= height);
            for y in r.y..r.y + r.height {
                for x in r.x..r.x + r.width {
                    counts[(y * width + x) as usize] += 1;
                }
            }
        }
        assert!(counts.iter().all(|&c| c >= 1), "coverage has gaps");
        let max_layers = counts.iter().copied().max().unwrap_or(0);
        assert!(max_layers <= 4, "more than corner-deep overlap");
        let single = counts.iter().filter(|&&c| c == 1).count() as u64;
        // Overlap double-counting is bounded by the band area.
        let band = 2 * overlap as u64 * (width as u64 + height as u64) * 2;
        assert!(width as u64 * height as u64 - single <= band);
    }

    #[test]
    fn test_grid_regions_cover_image_exactly() {
        let regions = grid_regions(720, 540, 2, 2, 32);
        assert_eq!(regions.len(), 4);
        assert_exact_coverage(&regions, 720, 540, 32);
        // No overlap added at the image boundary
        assert_eq!(regions[0].x, 0);
        assert_eq!(regions[0].y, 0);
        assert_eq!((regions[0].width, regions[0].height), (360, 270));
        // Internal edges carry the overlap
        assert_eq!(regions[1].x, 360 - 32);
        assert_eq!(regions[1].width, 360 + 32);
        assert!(regions[1].feathers_left() && !regions[1].feathers_top());
        assert!(regions[3].feathers_left() && regions[3].feathers_top());
    }

    #[test]
    fn test_grid_regions_uneven_division() {
        let regions = grid_regions(101, 55, 3, 2, 8);
        assert_exact_coverage(&regions, 101, 55, 8);
    }

    #[test]
    fn test_child_regions_partition_parent() {
        let parent = TileRegion {
            x: 328,
            y: 0,
            width: 392,
            height: 270,
            col: 1,
            row: 0,
        };
        let children = child_regions(&parent, 4, 32);
        assert_eq!(children.len(), 4);
        // Union equals the parent region
        let min_x = children.iter().map(|c| c.x).min().unwrap();
        let min_y = children.iter().map(|c| c.y).min().unwrap();
        let max_x = children.iter().map(|c| c.x + c.width).max().unwrap();
        let max_y = children.iter().map(|c| c.y + c.height).max().unwrap();
        assert_eq!((min_x, min_y), (parent.x, parent.y));
        assert_eq!((max_x, max_y), (parent.x + parent.width, parent.y + parent.height));
        // Children inherit feathering from the parent's left overlap
        assert!(children[0].feathers_left());
        // Combined area = parent area plus bounded overlap double-counting
        let combined: u64 = children.iter().map(|c| c.area()).sum();
        let slack = combined - parent.area();
        let band = 32u64 * (parent.width as u64 + parent.height as u64 + 64);
        assert!(slack <= band, "overlap double-count {} exceeds band {}", slack, band);
    }

    #[test]
    fn test_split_grid() {
        assert_eq!(split_grid(1), 1);
        assert_eq!(split_grid(4), 2);
        assert_eq!(split_grid(9), 3);
        assert_eq!(split_grid(25), 5);
        // Non-square factors round the grid up
        assert_eq!(split_grid(2), 2);
    }

    #[test]
    fn test_crop_tile_bounds_check() {
        let img = RgbImage::new(100, 100);
        let bad = TileRegion {
            x: 90,
            y: 0,
            width: 20,
            height: 10,
            col: 0,
            row: 0,
        };
        assert!(crop_tile(&img, &bad).is_err());
    }

    #[test]
    fn test_crop_child_maps_through_scale_ratio() {
        // Parent region 100x50 at (0,0), current output 400x200 (4x).
        let mut parent_img = RgbImage::new(400, 200);
        for (x, _y, p) in parent_img.enumerate_pixels_mut() {
            p.0 = [if x >= 200 { 255 } else { 0 }; 3];
        }
        let parent = TileRegion {
            x: 0,
            y: 0,
            width: 100,
            height: 50,
            col: 0,
            row: 0,
        };
        let children = child_regions(&parent, 4, 0);
        let right = crop_child(&parent_img, &parent, &children[1]).unwrap();
        assert_eq!((right.width(), right.height()), (200, 100));
        // The right-half child lands on the bright half of the output
        assert_eq!(right.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_derive_split_from_overflow() {
        // 720x720 output going into a 4x stage: 8.3M projected, needs 2x2.
        assert_eq!(derive_split_from_overflow(720, 720, 4), 4);
        // Small outputs need no split.
        assert_eq!(derive_split_from_overflow(360, 360, 2), 1);
    }
}
