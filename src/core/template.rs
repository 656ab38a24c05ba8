use serde::{Deserialize, Serialize};

use crate::core::{GPU_MAX_PIXELS, MAX_STAGE_MULTIPLIER};
use crate::error::UpscaleError;

/// One round of inference calls at a fixed multiplier.
///
/// `grid_cols`/`grid_rows` describe the tile layout of the whole image AT this
/// stage. `split_from_previous` is how many children each tile from the prior
/// stage becomes before this stage runs (1 = no split).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage_number: u32,
    pub scale_multiplier: u32,
    pub grid_cols: u32,
    pub grid_rows: u32,
    pub split_from_previous: u32,
}

impl StageConfig {
    pub fn tile_count(&self) -> u32 {
        self.grid_cols * self.grid_rows
    }
}

/// A precomputed stage plan for one (aspect bucket, scale) pair.
///
/// `max_input_width/height` bound the largest input the plan supports without
/// pre-downscaling; they are derived so that every stage's per-call input stays
/// under the GPU pixel budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleConfig {
    pub scale: u32,
    pub stages: Vec<StageConfig>,
    pub total_tiles: u32,
    pub requires_downscale: bool,
    pub max_input_width: u32,
    pub max_input_height: u32,
}

impl ScaleConfig {
    /// Product of all stage multipliers. May overshoot `scale`; the stitcher
    /// corrects with a final exact-dimension resize.
    pub fn cumulative_multiplier(&self) -> u32 {
        self.stages.iter().map(|s| s.scale_multiplier).product()
    }

    /// Product of multipliers of stages strictly before `stage_number`.
    pub fn multiplier_before(&self, stage_number: u32) -> u32 {
        self.stages
            .iter()
            .filter(|s| s.stage_number < stage_number)
            .map(|s| s.scale_multiplier)
            .product()
    }

    pub fn stage(&self, stage_number: u32) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.stage_number == stage_number)
    }

    pub fn total_stages(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn validate(&self) -> Result<(), UpscaleError> {
        if self.stages.is_empty() {
            return Err(UpscaleError::Planning("plan has no stages".into()));
        }
        let mut prev: Option<&StageConfig> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.stage_number != i as u32 + 1 {
                return Err(UpscaleError::Planning(format!(
                    "stage numbers must be 1-based and contiguous, got {} at index {}",
                    stage.stage_number, i
                )));
            }
            if stage.scale_multiplier == 0 || stage.scale_multiplier > MAX_STAGE_MULTIPLIER {
                return Err(UpscaleError::Planning(format!(
                    "stage {} multiplier {} out of range",
                    stage.stage_number, stage.scale_multiplier
                )));
            }
            if let Some(p) = prev {
                if stage.tile_count() != p.tile_count() * stage.split_from_previous {
                    return Err(UpscaleError::Planning(format!(
                        "stage {} tile count {} != prior {} x split {}",
                        stage.stage_number,
                        stage.tile_count(),
                        p.tile_count(),
                        stage.split_from_previous
                    )));
                }
            } else if stage.split_from_previous != 1 {
                return Err(UpscaleError::Planning(
                    "stage 1 cannot split from a previous stage".into(),
                ));
            }
            prev = Some(stage);
        }
        let peak = self.stages.iter().map(StageConfig::tile_count).max().unwrap_or(0);
        if self.total_tiles != peak {
            return Err(UpscaleError::Planning(format!(
                "total_tiles {} != peak stage tile count {}",
                self.total_tiles, peak
            )));
        }
        Ok(())
    }
}

/// A family of scale plans for one aspect-ratio bucket.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: &'static str,
    pub ratio: f64,
    pub scales: Vec<ScaleConfig>,
}

impl Template {
    pub fn scale_config(&self, scale: u32) -> Option<&ScaleConfig> {
        self.scales.iter().find(|c| c.scale == scale)
    }
}

/// Static lookup of precomputed stage plans. Catalog order is the tie-break
/// order for aspect matching (first minimum wins).
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: Vec<Template>,
}

/// Safety margin on derived max-input areas, absorbing ceil() slop in tile
/// dimensions.
const AREA_MARGIN: f64 = 0.97;

/// Shorthand used by the builtin catalog below.
fn stage(n: u32, mult: u32, cols: u32, rows: u32, split: u32) -> StageConfig {
    StageConfig {
        stage_number: n,
        scale_multiplier: mult,
        grid_cols: cols,
        grid_rows: rows,
        split_from_previous: split,
    }
}

/// Build a `ScaleConfig`, deriving the max input dimensions from the stage
/// list: for every stage, input pixels per call are
/// `(input_area / grid_area) * prior_multiplier^2`, which must stay under the
/// GPU budget.
fn config(ratio: f64, scale: u32, stages: Vec<StageConfig>) -> ScaleConfig {
    let mut area_cap = f64::MAX;
    let mut cum_prev: u64 = 1;
    for s in &stages {
        let grid_area = (s.grid_cols * s.grid_rows) as f64;
        let cap = GPU_MAX_PIXELS as f64 * grid_area / ((cum_prev * cum_prev) as f64);
        if cap < area_cap {
            area_cap = cap;
        }
        cum_prev *= s.scale_multiplier as u64;
    }
    let area = area_cap * AREA_MARGIN;
    let max_input_width = (area * ratio).sqrt().floor() as u32;
    let max_input_height = (area / ratio).sqrt().floor() as u32;
    let total_tiles = stages.iter().map(StageConfig::tile_count).max().unwrap_or(0);
    ScaleConfig {
        scale,
        stages,
        total_tiles,
        requires_downscale: false,
        max_input_width,
        max_input_height,
    }
}

/// Standard plan family shared by every aspect bucket. `g16` is the bucket's
/// stage-1 grid for the 16x plan; its stage 2 doubles the grid via a 4-way
/// split.
fn scale_family(ratio: f64, g16: (u32, u32)) -> Vec<ScaleConfig> {
    let (c, r) = g16;
    vec![
        config(ratio, 2, vec![stage(1, 2, 1, 1, 1)]),
        config(ratio, 4, vec![stage(1, 4, 2, 2, 1)]),
        config(ratio, 6, vec![stage(1, 4, 2, 2, 1), stage(2, 2, 2, 2, 1)]),
        config(ratio, 8, vec![stage(1, 4, 2, 2, 1), stage(2, 2, 2, 2, 1)]),
        config(ratio, 12, vec![stage(1, 4, 2, 2, 1), stage(2, 3, 4, 4, 4)]),
        config(
            ratio,
            16,
            vec![stage(1, 4, c, r, 1), stage(2, 4, c * 2, r * 2, 4)],
        ),
    ]
}

impl TemplateCatalog {
    /// The builtin catalog: seven aspect buckets, scales 2/4/6/8/12/16 each.
    pub fn builtin() -> Self {
        let templates = vec![
            Template {
                name: "square",
                ratio: 1.0,
                scales: scale_family(1.0, (4, 4)),
            },
            Template {
                name: "landscape-4x3",
                ratio: 4.0 / 3.0,
                scales: scale_family(4.0 / 3.0, (4, 3)),
            },
            Template {
                name: "portrait-3x4",
                ratio: 3.0 / 4.0,
                scales: scale_family(3.0 / 4.0, (3, 4)),
            },
            Template {
                name: "landscape-3x2",
                ratio: 3.0 / 2.0,
                scales: scale_family(3.0 / 2.0, (3, 2)),
            },
            Template {
                name: "portrait-2x3",
                ratio: 2.0 / 3.0,
                scales: scale_family(2.0 / 3.0, (2, 3)),
            },
            Template {
                name: "landscape-16x9",
                ratio: 16.0 / 9.0,
                scales: scale_family(16.0 / 9.0, (4, 2)),
            },
            Template {
                name: "portrait-9x16",
                ratio: 9.0 / 16.0,
                scales: scale_family(9.0 / 16.0, (2, 4)),
            },
        ];
        Self { templates }
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// Template whose ratio is closest to `width/height`. First minimum wins.
    pub fn nearest(&self, width: u32, height: u32) -> &Template {
        let ratio = width as f64 / height as f64;
        let mut best = &self.templates[0];
        let mut best_diff = f64::MAX;
        for t in &self.templates {
            let diff = (ratio - t.ratio).abs();
            if diff < best_diff {
                best_diff = diff;
                best = t;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_configs_validate() {
        for t in TemplateCatalog::builtin().templates() {
            for c in &t.scales {
                c.validate()
                    .unwrap_or_else(|e| panic!("{} x{}: {}", t.name, c.scale, e));
            }
        }
    }

    #[test]
    fn test_catalog_per_call_input_under_budget() {
        // At the declared max input, every stage's per-call input pixel count
        // must respect the GPU budget.
        for t in TemplateCatalog::builtin().templates() {
            for c in &t.scales {
                let mut cum_prev: u64 = 1;
                for s in &c.stages {
                    let in_w = (c.max_input_width as u64).div_ceil(s.grid_cols as u64) * cum_prev;
                    let in_h = (c.max_input_height as u64).div_ceil(s.grid_rows as u64) * cum_prev;
                    assert!(
                        in_w * in_h <= GPU_MAX_PIXELS,
                        "{} x{} stage {}: {}x{} input exceeds budget",
                        t.name,
                        c.scale,
                        s.stage_number,
                        in_w,
                        in_h
                    );
                    cum_prev *= s.scale_multiplier as u64;
                }
            }
        }
    }

    #[test]
    fn test_nearest_template_tiebreak_by_order() {
        let catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.nearest(1000, 1000).name, "square");
        assert_eq!(catalog.nearest(720, 540).name, "landscape-4x3");
        assert_eq!(catalog.nearest(540, 720).name, "portrait-3x4");
        assert_eq!(catalog.nearest(1920, 1080).name, "landscape-16x9");
        assert_eq!(catalog.nearest(1080, 1920).name, "portrait-9x16");
    }

    #[test]
    fn test_4x3_scale8_matches_expected_plan() {
        let catalog = TemplateCatalog::builtin();
        let c = catalog.nearest(720, 540).scale_config(8).unwrap();
        assert_eq!(c.stages.len(), 2);
        assert_eq!(c.stages[0].scale_multiplier, 4);
        assert_eq!((c.stages[0].grid_cols, c.stages[0].grid_rows), (2, 2));
        assert_eq!(c.stages[1].scale_multiplier, 2);
        assert_eq!((c.stages[1].grid_cols, c.stages[1].grid_rows), (2, 2));
        assert_eq!(c.stages[1].split_from_previous, 1);
        assert_eq!(c.total_tiles, 4);
        // 720x540 fits without downscaling
        assert!(720 <= c.max_input_width && 540 <= c.max_input_height);
    }

    #[test]
    fn test_4x3_scale16_declares_split() {
        let catalog = TemplateCatalog::builtin();
        let c = catalog.nearest(720, 540).scale_config(16).unwrap();
        assert_eq!(c.stages[0].tile_count(), 12);
        assert_eq!(c.stages[1].tile_count(), 48);
        assert_eq!(c.stages[1].split_from_previous, 4);
        assert_eq!(c.total_tiles, 48);
        assert_eq!(c.cumulative_multiplier(), 16);
    }

    #[test]
    fn test_validate_rejects_bad_split_arithmetic() {
        let mut c = config(
            1.0,
            16,
            vec![stage(1, 4, 2, 2, 1), stage(2, 4, 3, 3, 2)],
        );
        c.total_tiles = 9;
        assert!(c.validate().is_err());
    }
}
