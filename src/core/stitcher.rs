use image::RgbImage;

use crate::core::splitter::TileRegion;
use crate::core::{resize_rgb_image, ResampleFilter};
use crate::error::UpscaleError;

/// Fill for regions whose tile irrecoverably failed under the partial-success
/// policy. Never silently blank: the failed region is flat neutral gray and
/// the job records which tiles are missing.
const MISSING_TILE_FILL: [u8; 3] = [128, 128, 128];

/// One final-stage tile ready for compositing. `image: None` marks a tile the
/// partial-success policy already declared failed; any other unloadable tile
/// must abort the stitch before this struct is built.
pub struct StitchTile {
    pub tile_id: u64,
    pub region: TileRegion,
    pub image: Option<RgbImage>,
}

pub struct StitchParams {
    /// Dimensions dispatched to stage 1 (post-downscale, original coordinates).
    pub input_width: u32,
    pub input_height: u32,
    /// Product of all stage multipliers; tile outputs are at this scale.
    pub stitch_scale: u32,
    /// Literal requested output dimensions. When the stage chain overshot the
    /// requested scale these differ from the stitched canvas and trigger one
    /// exact-dimension resize pass.
    pub target_width: u32,
    pub target_height: u32,
    /// Overlap band in original pixels.
    pub overlap: u32,
    /// Filter for the exact-dimension pass.
    pub filter: ResampleFilter,
}

/// Composite all final-stage tiles into one image with linear alpha feathering
/// across overlap bands, on a white background. Deterministic: tiles are
/// composited in row-major region order regardless of input order.
pub fn stitch(mut tiles: Vec<StitchTile>, params: &StitchParams) -> Result<RgbImage, UpscaleError> {
    if tiles.is_empty() {
        return Err(UpscaleError::Stitch("no tiles to stitch".into()));
    }
    let c = params.stitch_scale;
    let canvas_w = params.input_width * c;
    let canvas_h = params.input_height * c;
    let mut canvas = vec![255u8; canvas_w as usize * canvas_h as usize * 3];

    tiles.sort_by_key(|t| (t.region.y, t.region.x, t.tile_id));

    for tile in &tiles {
        let r = &tile.region;
        if r.x + r.width > params.input_width || r.y + r.height > params.input_height {
            return Err(UpscaleError::Stitch(format!(
                "tile {} region out of canvas bounds",
                tile.tile_id
            )));
        }
        let dst_w = r.width * c;
        let dst_h = r.height * c;
        let normalized;
        let pixels: &RgbImage = match &tile.image {
            Some(img) if img.width() == dst_w && img.height() == dst_h => img,
            Some(img) => {
                // Stage rounding can leave the output a pixel or two off the
                // region's nominal size.
                normalized = resize_rgb_image(img, dst_w, dst_h, ResampleFilter::Bilinear);
                &normalized
            }
            None => {
                normalized = RgbImage::from_pixel(
                    dst_w,
                    dst_h,
                    image::Rgb(MISSING_TILE_FILL),
                );
                &normalized
            }
        };

        let band_l = if r.feathers_left() { params.overlap * c } else { 0 };
        let band_t = if r.feathers_top() { params.overlap * c } else { 0 };
        let base_x = (r.x * c) as usize;
        let base_y = (r.y * c) as usize;
        let stride = canvas_w as usize * 3;
        let src = pixels.as_raw();

        for y in 0..dst_h as usize {
            let fy = if band_t > 0 && (y as u32) < band_t {
                (y as f32 + 0.5) / band_t as f32
            } else {
                1.0
            };
            let row_off = (base_y + y) * stride + base_x * 3;
            let src_off = y * dst_w as usize * 3;
            for x in 0..dst_w as usize {
                let fx = if band_l > 0 && (x as u32) < band_l {
                    (x as f32 + 0.5) / band_l as f32
                } else {
                    1.0
                };
                let fade = fx * fy;
                let di = row_off + x * 3;
                let si = src_off + x * 3;
                if fade >= 1.0 {
                    canvas[di..di + 3].copy_from_slice(&src[si..si + 3]);
                } else {
                    for ch in 0..3 {
                        let blended = fade * src[si + ch] as f32
                            + (1.0 - fade) * canvas[di + ch] as f32;
                        canvas[di + ch] = blended.round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }

    let stitched = RgbImage::from_raw(canvas_w, canvas_h, canvas)
        .ok_or_else(|| UpscaleError::Stitch("canvas buffer size mismatch".into()))?;

    // One high-quality pass down to the literal target when the stage chain
    // overshot the requested scale.
    if (canvas_w, canvas_h) != (params.target_width, params.target_height) {
        return Ok(resize_rgb_image(
            &stitched,
            params.target_width,
            params.target_height,
            params.filter,
        ));
    }
    Ok(stitched)
}
