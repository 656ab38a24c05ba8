use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::template::{ScaleConfig, StageConfig, TemplateCatalog};
use crate::core::GPU_MAX_PIXELS;
use crate::error::UpscaleError;

/// Largest requested scale the planner accepts. Above 4x per stage the chain
/// is two stages, so this bounds stage-2 multipliers well under the practical
/// per-call ceiling.
pub const MAX_TARGET_SCALE: u32 = 32;

/// The full stage plan for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalePlan {
    pub config: ScaleConfig,
    pub template_name: String,
    /// Dimensions actually dispatched to stage 1, after any pre-downscale.
    pub input_width: u32,
    pub input_height: u32,
    /// Uniform factor applied to the source before tiling, when the source
    /// exceeds the config's max input.
    pub downscale_factor: Option<f64>,
    /// True when no catalog template carried the requested scale and a generic
    /// plan was synthesized instead.
    pub fallback: bool,
}

/// Picks the nearest-aspect template and returns its stage plan, or computes a
/// best-effort plan when the catalog has no entry for the requested scale.
#[derive(Debug, Clone)]
pub struct ScalePlanner {
    catalog: TemplateCatalog,
}

impl Default for ScalePlanner {
    fn default() -> Self {
        Self {
            catalog: TemplateCatalog::builtin(),
        }
    }
}

impl ScalePlanner {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self { catalog }
    }

    pub fn plan(&self, width: u32, height: u32, scale: u32) -> Result<ScalePlan, UpscaleError> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::Planning(format!(
                "degenerate image dimensions {}x{}",
                width, height
            )));
        }
        if !(2..=MAX_TARGET_SCALE).contains(&scale) {
            return Err(UpscaleError::Planning(format!(
                "scale {} out of supported range 2..={}",
                scale, MAX_TARGET_SCALE
            )));
        }

        let template = self.catalog.nearest(width, height);
        if let Some(config) = template.scale_config(scale) {
            let mut config = config.clone();
            let mut input_width = width;
            let mut input_height = height;
            let mut downscale_factor = None;
            if width > config.max_input_width || height > config.max_input_height {
                let f = (config.max_input_width as f64 / width as f64)
                    .min(config.max_input_height as f64 / height as f64);
                input_width = (width as f64 * f).floor() as u32;
                input_height = (height as f64 * f).floor() as u32;
                config.requires_downscale = true;
                downscale_factor = Some(f);
            }
            return Ok(ScalePlan {
                config,
                template_name: template.name.to_string(),
                input_width,
                input_height,
                downscale_factor,
                fallback: false,
            });
        }

        warn!(
            "no template plan for {} x{}, synthesizing fallback",
            template.name, scale
        );
        let config = synthesize_fallback(width, height, scale)?;
        Ok(ScalePlan {
            config,
            template_name: template.name.to_string(),
            input_width: width,
            input_height: height,
            downscale_factor: None,
            fallback: true,
        })
    }
}

/// Smallest square-ish grid whose tiles, upscaled by `mult`, stay under the
/// GPU pixel budget.
fn grid_for_output_budget(width: u32, height: u32, mult: u32) -> (u32, u32) {
    let mut cols = 1u32;
    let mut rows = 1u32;
    loop {
        let out_w = width.div_ceil(cols) as u64 * mult as u64;
        let out_h = height.div_ceil(rows) as u64 * mult as u64;
        if out_w * out_h <= GPU_MAX_PIXELS {
            return (cols, rows);
        }
        // Shrink the axis with the larger tile dimension first.
        if width.div_ceil(cols) >= height.div_ceil(rows) {
            cols += 1;
        } else {
            rows += 1;
        }
    }
}

/// Generic two-stage pattern: 4x first, `ceil(scale/4)` second, grids chosen so
/// every stage's per-call output respects the pixel budget. Deliberately a
/// best-effort plan, not guaranteed optimal; any overshoot of the literal scale
/// is corrected by the stitcher's final resize.
fn synthesize_fallback(width: u32, height: u32, scale: u32) -> Result<ScaleConfig, UpscaleError> {
    let stages = if scale <= 4 {
        let (cols, rows) = grid_for_output_budget(width, height, scale);
        vec![StageConfig {
            stage_number: 1,
            scale_multiplier: scale,
            grid_cols: cols,
            grid_rows: rows,
            split_from_previous: 1,
        }]
    } else {
        let m2 = scale.div_ceil(4);
        let cumulative = 4 * m2;
        let (c1, r1) = grid_for_output_budget(width, height, 4);
        let parent_w = width.div_ceil(c1);
        let parent_h = height.div_ceil(r1);
        // Grow the per-tile split until the stage-2 per-call output fits.
        let mut g = 1u32;
        loop {
            let out_w = parent_w.div_ceil(g) as u64 * cumulative as u64;
            let out_h = parent_h.div_ceil(g) as u64 * cumulative as u64;
            if out_w * out_h <= GPU_MAX_PIXELS {
                break;
            }
            g += 1;
        }
        vec![
            StageConfig {
                stage_number: 1,
                scale_multiplier: 4,
                grid_cols: c1,
                grid_rows: r1,
                split_from_previous: 1,
            },
            StageConfig {
                stage_number: 2,
                scale_multiplier: m2,
                grid_cols: c1 * g,
                grid_rows: r1 * g,
                split_from_previous: g * g,
            },
        ]
    };
    let total_tiles = stages.iter().map(StageConfig::tile_count).max().unwrap_or(0);
    let config = ScaleConfig {
        scale,
        stages,
        total_tiles,
        requires_downscale: false,
        max_input_width: width,
        max_input_height: height,
    };
    config.validate()?;
    Ok(config)
}
