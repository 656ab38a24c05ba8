pub mod planner;
pub mod splitter;
pub mod stitcher;
pub mod template;

use std::fmt;
use std::str::FromStr;

/// Hard per-inference-call pixel budget (~1448x1448). The GPU backend rejects
/// any call whose pixel count exceeds this.
pub const GPU_MAX_PIXELS: u64 = 2_096_704;

/// Overlap band between neighboring tiles, in original image pixels.
pub const TILE_OVERLAP: u32 = 32;

/// Practical ceiling for a single inference call's scale multiplier.
pub const MAX_STAGE_MULTIPLIER: u32 = 10;

/// Resampling filter for up/downscale operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleFilter {
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleFilter::Bilinear => write!(f, "bilinear"),
            ResampleFilter::Bicubic => write!(f, "bicubic"),
            ResampleFilter::Lanczos3 => write!(f, "lanczos3"),
        }
    }
}

impl FromStr for ResampleFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bilinear" | "triangle" => Ok(ResampleFilter::Bilinear),
            "bicubic" | "catmullrom" | "catmull-rom" => Ok(ResampleFilter::Bicubic),
            "lanczos3" | "lanczos" => Ok(ResampleFilter::Lanczos3),
            _ => Err(format!(
                "unknown resample filter '{}'. Available: bilinear, bicubic, lanczos3",
                s
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// SIMD-accelerated resize helpers (via fast_image_resize)
// ---------------------------------------------------------------------------

/// Resize an interleaved RGB buffer using SIMD-accelerated fast_image_resize.
pub fn fir_resize_rgb(
    pixels: &[u8],
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    filter: ResampleFilter,
) -> Vec<u8> {
    use fast_image_resize as fir;
    let src =
        fir::images::Image::from_vec_u8(src_w, src_h, pixels.to_vec(), fir::pixels::PixelType::U8x3)
            .expect("failed to create fir source image");
    let mut dst = fir::images::Image::new(dst_w, dst_h, fir::pixels::PixelType::U8x3);
    let alg = match filter {
        ResampleFilter::Bilinear => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
        ResampleFilter::Bicubic => fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        ResampleFilter::Lanczos3 => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
    };
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src, &mut dst, &fir::ResizeOptions::new().resize_alg(alg))
        .unwrap();
    dst.into_vec()
}

/// Resize an `RgbImage` to exact target dimensions.
pub fn resize_rgb_image(
    img: &image::RgbImage,
    dst_w: u32,
    dst_h: u32,
    filter: ResampleFilter,
) -> image::RgbImage {
    let out = fir_resize_rgb(img.as_raw(), img.width(), img.height(), dst_w, dst_h, filter);
    image::RgbImage::from_raw(dst_w, dst_h, out).expect("resize output buffer size mismatch")
}
