use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::planner::{ScalePlan, MAX_TARGET_SCALE};
use crate::core::splitter::TileRegion;
use crate::error::UpscaleError;

// ---------------------------------------------------------------------------
// Job settings — closed, versioned configuration validated at creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            _ => Err(format!("unknown output format '{}'. Available: png, jpeg", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobSettings {
    pub scale: u32,
    pub output_format: OutputFormat,
}

impl JobSettings {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        if !(2..=MAX_TARGET_SCALE).contains(&self.scale) {
            return Err(UpscaleError::Planning(format!(
                "scale {} out of supported range 2..={}",
                self.scale, MAX_TARGET_SCALE
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tile record — one row per tile per job, never deleted, only superseded
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Pending,
    StageComplete(u32),
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileRecord {
    pub tile_id: u64,
    /// Region in ORIGINAL pre-upscale coordinates. Immutable for the life of
    /// the tile; a split mints children with recomputed sub-regions instead.
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub grid_col: u32,
    pub grid_row: u32,
    /// Input for the next pending stage.
    pub input_url: String,
    pub stage_outputs: BTreeMap<u32, String>,
    pub stage_predictions: BTreeMap<u32, String>,
    /// Dispatch attempts per stage; bounds the retry budget.
    pub attempts: BTreeMap<u32, u32>,
    pub status: TileStatus,
    /// Once split, a tile keeps its outputs as provenance but is excluded from
    /// forward dispatch.
    pub superseded: bool,
    pub parent_tile_id: Option<u64>,
    pub sub_tile_index: Option<u32>,
    pub sub_tile_grid: Option<u32>,
    pub error: Option<String>,
}

impl TileRecord {
    pub fn new(tile_id: u64, region: TileRegion, input_url: String) -> Self {
        Self {
            tile_id,
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            grid_col: region.col,
            grid_row: region.row,
            input_url,
            stage_outputs: BTreeMap::new(),
            stage_predictions: BTreeMap::new(),
            attempts: BTreeMap::new(),
            status: TileStatus::Pending,
            superseded: false,
            parent_tile_id: None,
            sub_tile_index: None,
            sub_tile_grid: None,
            error: None,
        }
    }

    pub fn region(&self) -> TileRegion {
        TileRegion {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            col: self.grid_col,
            row: self.grid_row,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.superseded
    }

    pub fn output_for(&self, stage: u32) -> Option<&str> {
        self.stage_outputs.get(&stage).map(String::as_str)
    }

    /// Terminal per-tile state for a stage: success or irrecoverable failure.
    pub fn terminal_for(&self, stage: u32) -> bool {
        self.status == TileStatus::Failed || self.stage_outputs.contains_key(&stage)
    }

    pub fn attempts_for(&self, stage: u32) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Job record — the single source of truth for one upscaling job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    NeedsSplit,
    TilesReady,
    Completed,
    Failed,
    PartialSuccess,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::PartialSuccess
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    /// Source dimensions before any pre-downscale.
    pub original_width: u32,
    pub original_height: u32,
    pub target_scale: u32,
    pub settings: JobSettings,
    /// The full stage plan, embedded so any worker can recompute splits
    /// without re-deriving them.
    pub plan: ScalePlan,
    pub current_stage: u32,
    pub status: JobStatus,
    /// Overlap band in original pixels, fixed at creation.
    pub overlap: u32,
    pub tiles: Vec<TileRecord>,
    next_tile_id: u64,
    pub source_url: String,
    pub final_output_url: Option<String>,
    pub error: Option<String>,
    /// True once the partial-success policy has accepted failed tiles.
    pub degraded: bool,
    /// Bumped on every store write; concurrent writers must not interleave.
    pub version: u64,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        original_width: u32,
        original_height: u32,
        settings: JobSettings,
        plan: ScalePlan,
        overlap: u32,
        source_url: String,
    ) -> Self {
        Self {
            job_id,
            created_at: Utc::now(),
            original_width,
            original_height,
            target_scale: settings.scale,
            settings,
            plan,
            current_stage: 0,
            status: JobStatus::Pending,
            overlap,
            tiles: Vec::new(),
            next_tile_id: 1,
            source_url,
            final_output_url: None,
            error: None,
            degraded: false,
            version: 0,
        }
    }

    pub fn total_stages(&self) -> u32 {
        self.plan.config.total_stages()
    }

    pub fn mint_tile_id(&mut self) -> u64 {
        let id = self.next_tile_id;
        self.next_tile_id += 1;
        id
    }

    pub fn active_tiles(&self) -> impl Iterator<Item = &TileRecord> {
        self.tiles.iter().filter(|t| t.is_active())
    }

    pub fn tile(&self, tile_id: u64) -> Option<&TileRecord> {
        self.tiles.iter().find(|t| t.tile_id == tile_id)
    }

    pub fn tile_mut(&mut self, tile_id: u64) -> Option<&mut TileRecord> {
        self.tiles.iter_mut().find(|t| t.tile_id == tile_id)
    }

    /// Stage N is complete only when every active tile has reached a terminal
    /// per-tile state for it.
    pub fn stage_resolved(&self, stage: u32) -> bool {
        let mut any = false;
        for t in self.active_tiles() {
            any = true;
            if !t.terminal_for(stage) {
                return false;
            }
        }
        any
    }

    /// Progress 0-100 over tile-stage units, weighted by each stage's tile
    /// count so earlier (smaller) stages count less.
    pub fn progress(&self) -> u8 {
        match self.status {
            JobStatus::Completed | JobStatus::PartialSuccess => return 100,
            JobStatus::Pending => return 0,
            _ => {}
        }
        let total: u64 = self
            .plan
            .config
            .stages
            .iter()
            .map(|s| s.tile_count() as u64)
            .sum();
        if total == 0 {
            return 0;
        }
        let mut done: f64 = 0.0;
        for s in &self.plan.config.stages {
            let w = s.tile_count() as f64;
            if s.stage_number < self.current_stage {
                done += w;
            } else if s.stage_number == self.current_stage {
                let active: Vec<_> = self.active_tiles().collect();
                if !active.is_empty() {
                    let complete = active
                        .iter()
                        .filter(|t| t.terminal_for(s.stage_number))
                        .count();
                    done += w * complete as f64 / active.len() as f64;
                }
            }
        }
        // Stitching owns the last point.
        ((done / total as f64) * 99.0).floor() as u8
    }
}

// ---------------------------------------------------------------------------
// JobStore — durable job records, one JSON file per job
// ---------------------------------------------------------------------------

/// All coordination state lives here; per-job mutation runs under a single
/// per-job lock and every write bumps the version and hits disk before the
/// lock is released.
pub struct JobStore {
    root: PathBuf,
    jobs: Mutex<HashMap<String, Arc<Mutex<JobRecord>>>>,
}

impl JobStore {
    pub fn open(root: &Path) -> Result<Self, UpscaleError> {
        let root = root.join("jobs");
        fs::create_dir_all(&root)
            .map_err(|e| UpscaleError::Storage(format!("create {}: {}", root.display(), e)))?;
        let mut jobs = HashMap::new();
        for entry in fs::read_dir(&root)
            .map_err(|e| UpscaleError::Storage(format!("read {}: {}", root.display(), e)))?
        {
            let entry = entry.map_err(|e| UpscaleError::Storage(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .map_err(|e| UpscaleError::Storage(format!("read {}: {}", path.display(), e)))?;
            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(job) => {
                    jobs.insert(job.job_id.clone(), Arc::new(Mutex::new(job)));
                }
                Err(e) => {
                    tracing::warn!("skipping unreadable job file {}: {}", path.display(), e);
                }
            }
        }
        Ok(Self {
            root,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn create(&self, job: JobRecord) -> Result<(), UpscaleError> {
        let mut map = self.jobs.lock();
        if map.contains_key(&job.job_id) {
            return Err(UpscaleError::InvalidState(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        self.persist(&job)?;
        map.insert(job.job_id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobRecord> {
        let handle = self.jobs.lock().get(job_id).cloned()?;
        let job = handle.lock();
        Some(job.clone())
    }

    /// Mutate one job under its lock; the version bump and disk write happen
    /// before the lock is released, so two concurrent advance attempts cannot
    /// both act on the same stale state.
    pub fn with_job<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobRecord) -> R,
    ) -> Result<R, UpscaleError> {
        let handle = self
            .jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        let mut job = handle.lock();
        let out = f(&mut job);
        job.version += 1;
        self.persist(&job)?;
        Ok(out)
    }

    /// Job IDs that are not yet terminal, for the reconciliation sweep.
    pub fn in_flight(&self) -> Vec<String> {
        let map = self.jobs.lock();
        map.iter()
            .filter(|(_, handle)| !handle.lock().status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn persist(&self, job: &JobRecord) -> Result<(), UpscaleError> {
        let path = self.root.join(format!("{}.json", job.job_id));
        let tmp = self.root.join(format!("{}.json.tmp", job.job_id));
        let body = serde_json::to_vec_pretty(job)
            .map_err(|e| UpscaleError::Storage(format!("serialize job: {}", e)))?;
        fs::write(&tmp, body)
            .map_err(|e| UpscaleError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| UpscaleError::Storage(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::ScalePlanner;

    fn test_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tilescale-test-{}-{}", tag, uuid::Uuid::new_v4()))
    }

    fn sample_job(id: &str, scale: u32) -> JobRecord {
        let settings = JobSettings {
            scale,
            output_format: OutputFormat::Png,
        };
        let plan = ScalePlanner::default().plan(720, 540, scale).unwrap();
        JobRecord::new(id.to_string(), 720, 540, settings, plan, 32, "src".into())
    }

    #[test]
    fn test_settings_validation() {
        let ok = JobSettings {
            scale: 8,
            output_format: OutputFormat::Jpeg,
        };
        assert!(ok.validate().is_ok());
        let bad = JobSettings {
            scale: 1,
            output_format: OutputFormat::Png,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tile_ids_monotonic() {
        let mut job = sample_job("j1", 8);
        assert_eq!(job.mint_tile_id(), 1);
        assert_eq!(job.mint_tile_id(), 2);
        assert_eq!(job.mint_tile_id(), 3);
    }

    #[test]
    fn test_progress_weights_later_stages_heavier() {
        // Scale 16 on 4:3: stage 1 has 12 tiles, stage 2 has 48.
        let mut job = sample_job("j2", 16);
        job.status = JobStatus::Processing;
        job.current_stage = 1;
        let regions =
            crate::core::splitter::grid_regions(720, 540, 4, 3, 32);
        for r in regions {
            let id = job.mint_tile_id();
            job.tiles.push(TileRecord::new(id, r, "in".into()));
        }
        assert_eq!(job.progress(), 0);
        for t in job.tiles.iter_mut().take(6) {
            t.stage_outputs.insert(1, "out".into());
        }
        // Half of a 12/60 weight stage: 10% of the whole.
        let half_stage = job.progress();
        assert!(half_stage >= 9 && half_stage <= 10, "got {}", half_stage);
        for t in job.tiles.iter_mut() {
            t.stage_outputs.insert(1, "out".into());
        }
        job.current_stage = 2;
        let after_stage1 = job.progress();
        assert!(after_stage1 >= 19 && after_stage1 <= 20, "got {}", after_stage1);
        job.status = JobStatus::Completed;
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn test_stage_resolved_requires_all_active_tiles() {
        let mut job = sample_job("j3", 8);
        let regions = crate::core::splitter::grid_regions(720, 540, 2, 2, 32);
        for r in regions {
            let id = job.mint_tile_id();
            job.tiles.push(TileRecord::new(id, r, "in".into()));
        }
        assert!(!job.stage_resolved(1));
        for t in job.tiles.iter_mut().take(3) {
            t.stage_outputs.insert(1, "out".into());
        }
        assert!(!job.stage_resolved(1));
        // A failed tile is terminal too.
        job.tiles[3].status = TileStatus::Failed;
        assert!(job.stage_resolved(1));
        // Superseded tiles are excluded.
        job.tiles[3].status = TileStatus::Pending;
        job.tiles[3].superseded = true;
        assert!(job.stage_resolved(1));
    }

    #[test]
    fn test_store_roundtrip_and_versioning() {
        let root = test_root("store");
        let store = JobStore::open(&root).unwrap();
        store.create(sample_job("job-a", 8)).unwrap();
        store
            .with_job("job-a", |j| {
                j.status = JobStatus::Processing;
                j.current_stage = 1;
            })
            .unwrap();
        let snap = store.snapshot("job-a").unwrap();
        assert_eq!(snap.status, JobStatus::Processing);
        assert_eq!(snap.version, 1);

        // A fresh store instance reloads the persisted record.
        let reopened = JobStore::open(&root).unwrap();
        let snap2 = reopened.snapshot("job-a").unwrap();
        assert_eq!(snap2.status, JobStatus::Processing);
        assert_eq!(snap2.version, 1);

        assert_eq!(store.in_flight(), vec!["job-a".to_string()]);
        store
            .with_job("job-a", |j| j.status = JobStatus::Completed)
            .unwrap();
        assert!(store.in_flight().is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_store_rejects_duplicate_create() {
        let root = test_root("dup");
        let store = JobStore::open(&root).unwrap();
        store.create(sample_job("job-b", 8)).unwrap();
        assert!(store.create(sample_job("job-b", 8)).is_err());
        let _ = fs::remove_dir_all(&root);
    }
}
