use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use image::RgbImage;
use rayon::prelude::*;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::core::planner::ScalePlanner;
use crate::core::splitter::{
    child_regions, crop_child, crop_tile, derive_split_from_overflow, grid_regions, split_grid,
    TileRegion,
};
use crate::core::stitcher::{stitch, StitchParams, StitchTile};
use crate::core::{resize_rgb_image, ResampleFilter, TILE_OVERLAP};
use crate::error::UpscaleError;
use crate::inference::{InferenceBackend, PredictionStatus};
use crate::job::{
    JobRecord, JobSettings, JobStatus, JobStore, OutputFormat, TileRecord, TileStatus,
};
use crate::storage::BlobStore;

const JPEG_QUALITY: u8 = 92;

/// Marker written into a tile's prediction slot before the backend call is
/// issued, so a concurrent advance never double-dispatches. Carries the unix
/// timestamp it was written at: `dispatching:<secs>`.
const DISPATCH_MARKER: &str = "dispatching";

/// Age past which a marker is presumed orphaned by a dead process. Must sit
/// well above the backend client timeout: a live create call cannot still be
/// on the wire when its marker reaches this age.
const STALE_MARKER_SECS: i64 = 120;

fn dispatch_marker() -> String {
    format!("{}:{}", DISPATCH_MARKER, chrono::Utc::now().timestamp())
}

fn is_dispatch_marker(value: &str) -> bool {
    value.starts_with(DISPATCH_MARKER)
}

/// Seconds since the marker was written, or `None` for a real prediction id.
fn marker_age_secs(value: &str) -> Option<i64> {
    let ts = value
        .strip_prefix(DISPATCH_MARKER)?
        .strip_prefix(':')?
        .parse::<i64>()
        .ok()?;
    Some(chrono::Utc::now().timestamp() - ts)
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Dispatch attempts per tile per stage.
    pub max_retries: u32,
    /// Failed-tile fraction above which the whole job fails instead of
    /// degrading to partial success.
    pub max_failed_tile_fraction: f64,
    /// Wall-clock cap on a job's life.
    pub job_timeout: Duration,
    pub dispatch_concurrency: usize,
    /// Filter for the stitcher's exact-dimension pass.
    pub final_filter: ResampleFilter,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_failed_tile_fraction: 0.25,
            job_timeout: Duration::from_secs(600),
            dispatch_concurrency: 8,
            final_filter: ResampleFilter::Lanczos3,
        }
    }
}

/// A replacement tile handed back through the resume interface after an
/// external split.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeTile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub grid_col: u32,
    pub grid_row: u32,
    pub input_url: String,
    pub parent_tile_id: Option<u64>,
    pub sub_tile_index: Option<u32>,
    pub sub_tile_grid: Option<u32>,
}

/// Owns the job lifecycle: splits, stage dispatch, barriers, re-splits,
/// stitching, and the single partial-success decision point. All coordination
/// state lives in the job store; this struct holds no per-job memory, so any
/// number of advance calls (poller, sweeper, HTTP) are safe to interleave.
pub struct Orchestrator {
    store: Arc<JobStore>,
    backend: Arc<dyn InferenceBackend>,
    blobs: Arc<dyn BlobStore>,
    planner: ScalePlanner,
    policy: PolicyConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        backend: Arc<dyn InferenceBackend>,
        blobs: Arc<dyn BlobStore>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            backend,
            blobs,
            planner: ScalePlanner::default(),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Job creation
    // -----------------------------------------------------------------------

    /// Validate settings, plan the stage chain, persist the (possibly
    /// pre-downscaled) source, and create the job in `Pending`.
    pub async fn create_job(
        &self,
        image_bytes: Bytes,
        settings: JobSettings,
    ) -> Result<String, UpscaleError> {
        settings.validate()?;
        let decoded = image::load_from_memory(&image_bytes)
            .map_err(|e| UpscaleError::Decode(format!("source image: {}", e)))?
            .to_rgb8();
        let (width, height) = (decoded.width(), decoded.height());
        let plan = self.planner.plan(width, height, settings.scale)?;

        let source = if plan.downscale_factor.is_some() {
            info!(
                "downscaling {}x{} -> {}x{} to fit plan",
                width, height, plan.input_width, plan.input_height
            );
            resize_rgb_image(
                &decoded,
                plan.input_width,
                plan.input_height,
                ResampleFilter::Lanczos3,
            )
        } else {
            decoded
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        let png = encode_rgb(&source, OutputFormat::Png)?;
        let source_url = self
            .blobs
            .put(&format!("jobs/{}/source.png", job_id), png, "image/png")
            .await?;

        let job = JobRecord::new(
            job_id.clone(),
            width,
            height,
            settings,
            plan,
            TILE_OVERLAP,
            source_url,
        );
        self.store.create(job)?;
        info!("job {} created ({}x{} x{})", job_id, width, height, settings.scale);
        Ok(job_id)
    }

    // -----------------------------------------------------------------------
    // Advance — the idempotent "check and advance" operation
    // -----------------------------------------------------------------------

    pub async fn advance(&self, job_id: &str) -> Result<JobStatus, UpscaleError> {
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status.is_terminal() {
            return Ok(snap.status);
        }
        let age = chrono::Utc::now()
            .signed_duration_since(snap.created_at)
            .to_std()
            .unwrap_or_default();
        if age > self.policy.job_timeout {
            return self.fail_with_timeout(job_id);
        }

        match snap.status {
            JobStatus::Pending => self.init_first_stage(job_id).await?,
            JobStatus::Processing => self.poll_and_resolve(job_id).await?,
            JobStatus::NeedsSplit => self.perform_splits(job_id).await?,
            JobStatus::TilesReady => self.finalize(job_id).await?,
            _ => {}
        }

        self.store
            .snapshot(job_id)
            .map(|j| j.status)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))
    }

    /// Terminal timeout, distinguishable from a backend-reported failure.
    pub fn fail_with_timeout(&self, job_id: &str) -> Result<JobStatus, UpscaleError> {
        let timeout = self.policy.job_timeout;
        self.store.with_job(job_id, move |job| {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(UpscaleError::Timeout(timeout).to_string());
                warn!("job {} timed out", job.job_id);
            }
            job.status
        })
    }

    /// Mark a non-terminal job cancelled. In-flight predictions are abandoned,
    /// not cancelled remotely.
    pub fn cancel(&self, job_id: &str) -> Result<(), UpscaleError> {
        self.store.with_job(job_id, |job| {
            if job.status.is_terminal() {
                return Err(UpscaleError::InvalidState(format!(
                    "job {} is already {:?}",
                    job.job_id, job.status
                )));
            }
            job.status = JobStatus::Failed;
            job.error = Some("cancelled by caller".to_string());
            info!("job {} cancelled", job.job_id);
            Ok(())
        })?
    }

    /// Resume interface: accept a post-split tile list from an external split
    /// worker. Rejected unless the job is waiting in `NeedsSplit`.
    pub fn resume(
        &self,
        job_id: &str,
        stage: u32,
        tiles: Vec<ResumeTile>,
    ) -> Result<(), UpscaleError> {
        self.store.with_job(job_id, |job| {
            if job.status != JobStatus::NeedsSplit {
                return Err(UpscaleError::InvalidState(format!(
                    "job {} is {:?}, resume requires needs_split",
                    job.job_id, job.status
                )));
            }
            if stage != job.current_stage + 1 {
                return Err(UpscaleError::InvalidState(format!(
                    "resume stage {} does not follow current stage {}",
                    stage, job.current_stage
                )));
            }
            for t in tiles {
                let parent = t.parent_tile_id;
                let id = job.mint_tile_id();
                let mut rec = TileRecord::new(
                    id,
                    TileRegion {
                        x: t.x,
                        y: t.y,
                        width: t.width,
                        height: t.height,
                        col: t.grid_col,
                        row: t.grid_row,
                    },
                    t.input_url,
                );
                rec.parent_tile_id = parent;
                rec.sub_tile_index = t.sub_tile_index;
                rec.sub_tile_grid = t.sub_tile_grid;
                job.tiles.push(rec);
                if let Some(pid) = parent {
                    if let Some(p) = job.tile_mut(pid) {
                        p.superseded = true;
                    }
                }
            }
            job.current_stage = stage;
            job.status = JobStatus::Processing;
            info!("job {} resumed at stage {}", job.job_id, stage);
            Ok(())
        })?
    }

    // -----------------------------------------------------------------------
    // Stage 1 initialization
    // -----------------------------------------------------------------------

    async fn init_first_stage(&self, job_id: &str) -> Result<(), UpscaleError> {
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        let stage = match snap.plan.config.stage(1) {
            Some(s) => s.clone(),
            None => return self.fail_job(job_id, "plan has no stage 1"),
        };

        let source = self.blobs.fetch(&snap.source_url).await?;
        let img = match image::load_from_memory(&source) {
            Ok(i) => i.to_rgb8(),
            Err(e) => return self.fail_job(job_id, &format!("source decode: {}", e)),
        };

        let regions = grid_regions(
            snap.plan.input_width,
            snap.plan.input_height,
            stage.grid_cols,
            stage.grid_rows,
            snap.overlap,
        );
        let mut uploads = Vec::with_capacity(regions.len());
        for (i, region) in regions.iter().enumerate() {
            let tile = crop_tile(&img, region)?;
            let png = encode_rgb(&tile, OutputFormat::Png)?;
            let url = self
                .blobs
                .put(
                    &format!("jobs/{}/stage1/tile-{}.png", job_id, i + 1),
                    png,
                    "image/png",
                )
                .await?;
            uploads.push((*region, url));
        }

        // Only the advance that wins the Pending -> Processing transition
        // attaches tiles; a concurrent loser produced identical blobs and
        // drops its work here.
        let attached = self.store.with_job(job_id, |job| {
            if job.status != JobStatus::Pending {
                return false;
            }
            for (region, url) in uploads {
                let id = job.mint_tile_id();
                job.tiles.push(TileRecord::new(id, region, url));
            }
            job.current_stage = 1;
            job.status = JobStatus::Processing;
            true
        })?;
        if attached {
            info!(
                "job {} stage 1: {} tiles ({}x{} grid)",
                job_id, stage.tile_count(), stage.grid_cols, stage.grid_rows
            );
            self.dispatch_pending(job_id, 1).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch + polling
    // -----------------------------------------------------------------------

    /// Dispatch every active tile that still needs this stage and has retry
    /// budget left. Tiles are marked inside the job lock before any call goes
    /// out, which is what makes a second concurrent advance a no-op.
    async fn dispatch_pending(&self, job_id: &str, stage: u32) -> Result<(), UpscaleError> {
        let multiplier = self
            .store
            .snapshot(job_id)
            .and_then(|j| j.plan.config.stage(stage).map(|s| s.scale_multiplier))
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;

        let max_retries = self.policy.max_retries;
        let marked: Vec<(u64, String)> = self.store.with_job(job_id, |job| {
            if job.status != JobStatus::Processing || job.current_stage != stage {
                return Vec::new();
            }
            let mut marked = Vec::new();
            let mut exhausted = Vec::new();
            for t in job.tiles.iter_mut().filter(|t| t.is_active()) {
                if t.status == TileStatus::Failed
                    || t.stage_outputs.contains_key(&stage)
                    || t.stage_predictions.contains_key(&stage)
                {
                    continue;
                }
                if t.attempts_for(stage) >= max_retries {
                    exhausted.push(t.tile_id);
                    continue;
                }
                *t.attempts.entry(stage).or_insert(0) += 1;
                t.stage_predictions.insert(stage, dispatch_marker());
                marked.push((t.tile_id, t.input_url.clone()));
            }
            for id in exhausted {
                if let Some(t) = job.tile_mut(id) {
                    t.status = TileStatus::Failed;
                    t.error
                        .get_or_insert_with(|| format!("stage {}: retries exhausted", stage));
                }
            }
            marked
        })?;
        if marked.is_empty() {
            return Ok(());
        }

        let sem = Arc::new(Semaphore::new(self.policy.dispatch_concurrency));
        let calls = marked.into_iter().map(|(tile_id, input_url)| {
            let sem = sem.clone();
            async move {
                let _permit = sem.acquire().await;
                let result = self.backend.create(&input_url, multiplier).await;
                self.record_dispatch_result(job_id, stage, tile_id, result);
            }
        });
        join_all(calls).await;
        Ok(())
    }

    fn record_dispatch_result(
        &self,
        job_id: &str,
        stage: u32,
        tile_id: u64,
        result: Result<crate::inference::Prediction, UpscaleError>,
    ) {
        let max_retries = self.policy.max_retries;
        let outcome = self.store.with_job(job_id, |job| {
            let Some(t) = job.tile_mut(tile_id) else {
                return;
            };
            match &result {
                Ok(pred) => {
                    t.stage_predictions.insert(stage, pred.id.clone());
                    if pred.status == PredictionStatus::Succeeded {
                        if let Some(url) = &pred.output_url {
                            t.stage_outputs.insert(stage, url.clone());
                            t.status = TileStatus::StageComplete(stage);
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    // Free the slot so the next poll cycle retries, unless the
                    // budget is spent.
                    t.stage_predictions.remove(&stage);
                    if t.attempts_for(stage) >= max_retries {
                        t.status = TileStatus::Failed;
                        t.error = Some(format!("stage {}: {}", stage, e));
                    }
                }
                Err(e) => {
                    // Deterministic rejection: no point retrying.
                    t.stage_predictions.remove(&stage);
                    t.status = TileStatus::Failed;
                    t.error = Some(format!("stage {}: {}", stage, e));
                }
            }
        });
        if let Err(e) = outcome {
            warn!("job {} tile {}: failed to record dispatch: {}", job_id, tile_id, e);
        }
    }

    async fn poll_and_resolve(&self, job_id: &str) -> Result<(), UpscaleError> {
        self.poll_predictions(job_id, false).await?;
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status != JobStatus::Processing {
            return Ok(());
        }
        let stage = snap.current_stage;
        self.dispatch_pending(job_id, stage).await?;

        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status == JobStatus::Processing && snap.stage_resolved(stage) {
            self.resolve_barrier(job_id, stage).await?;
        }
        Ok(())
    }

    /// Re-query the backend for every in-flight prediction of this job and
    /// force-update tile state. Used by the poller's staleness fallback and by
    /// the global reconciliation sweep when the primary completion signal
    /// appears stuck.
    pub async fn reconcile_job(&self, job_id: &str) -> Result<(), UpscaleError> {
        info!("reconciling job {}", job_id);
        self.poll_predictions(job_id, true).await?;
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status == JobStatus::Processing && snap.stage_resolved(snap.current_stage) {
            self.resolve_barrier(job_id, snap.current_stage).await?;
        }
        Ok(())
    }

    async fn poll_predictions(&self, job_id: &str, reconcile: bool) -> Result<(), UpscaleError> {
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status != JobStatus::Processing {
            return Ok(());
        }
        let stage = snap.current_stage;
        let pending: Vec<(u64, String)> = snap
            .active_tiles()
            .filter(|t| {
                t.status != TileStatus::Failed && !t.stage_outputs.contains_key(&stage)
            })
            .filter_map(|t| {
                t.stage_predictions
                    .get(&stage)
                    .filter(|p| !is_dispatch_marker(p))
                    .map(|p| (t.tile_id, p.clone()))
            })
            .collect();

        if reconcile {
            // A marker left over from a process that died between marking and
            // dispatch must be freed so the tile redispatches, but a fresh one
            // may belong to a create call still on the wire. Only age proves
            // the owner is gone.
            self.store.with_job(job_id, |job| {
                for t in job.tiles.iter_mut().filter(|t| t.is_active()) {
                    let stale = t
                        .stage_predictions
                        .get(&stage)
                        .and_then(|v| marker_age_secs(v))
                        .is_some_and(|age| age >= STALE_MARKER_SECS);
                    if stale {
                        warn!(
                            "job {} tile {}: clearing stale dispatch marker",
                            job.job_id, t.tile_id
                        );
                        t.stage_predictions.remove(&stage);
                    }
                }
            })?;
        }

        let max_retries = self.policy.max_retries;
        for (tile_id, prediction_id) in pending {
            match self.backend.get(&prediction_id).await {
                Ok(pred) => {
                    self.store.with_job(job_id, |job| {
                        let Some(t) = job.tile_mut(tile_id) else { return };
                        match pred.status {
                            PredictionStatus::Succeeded => {
                                if let Some(url) = &pred.output_url {
                                    if reconcile && !t.stage_outputs.contains_key(&stage) {
                                        info!(
                                            "job {} tile {}: completion recovered by reconcile",
                                            job_id, tile_id
                                        );
                                    }
                                    t.stage_outputs.insert(stage, url.clone());
                                    t.status = TileStatus::StageComplete(stage);
                                } else {
                                    t.stage_predictions.remove(&stage);
                                }
                            }
                            PredictionStatus::Failed | PredictionStatus::Canceled => {
                                t.stage_predictions.remove(&stage);
                                if t.attempts_for(stage) >= max_retries {
                                    t.status = TileStatus::Failed;
                                    t.error = Some(format!(
                                        "stage {}: {}",
                                        stage,
                                        pred.error.as_deref().unwrap_or("prediction failed")
                                    ));
                                }
                            }
                            PredictionStatus::Starting | PredictionStatus::Processing => {}
                        }
                    })?;
                }
                Err(e) if e.is_transient() => {
                    warn!("job {} tile {}: poll failed: {}", job_id, tile_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage barrier — the single policy decision point
    // -----------------------------------------------------------------------

    async fn resolve_barrier(&self, job_id: &str, stage: u32) -> Result<(), UpscaleError> {
        let frac_limit = self.policy.max_failed_tile_fraction;
        let next = self.store.with_job(job_id, |job| {
            if job.status != JobStatus::Processing || job.current_stage != stage {
                return None;
            }
            let active: Vec<u64> = job.active_tiles().map(|t| t.tile_id).collect();
            let failed: Vec<u64> = job
                .active_tiles()
                .filter(|t| t.status == TileStatus::Failed)
                .map(|t| t.tile_id)
                .collect();
            let succeeded = active.len() - failed.len();

            if !failed.is_empty() {
                match barrier_decision(active.len(), failed.len(), succeeded, frac_limit) {
                    BarrierPolicy::Fail => {
                        job.status = JobStatus::Failed;
                        job.error = Some(format!(
                            "{} of {} tiles failed at stage {} (tiles {:?})",
                            failed.len(),
                            active.len(),
                            stage,
                            failed
                        ));
                        return None;
                    }
                    BarrierPolicy::Degrade => {
                        job.degraded = true;
                        job.error = Some(format!(
                            "degraded: tiles {:?} failed at stage {}",
                            failed, stage
                        ));
                    }
                }
            }

            if stage >= job.total_stages() {
                job.status = JobStatus::TilesReady;
                return None;
            }
            let needs_split = job
                .plan
                .config
                .stage(stage + 1)
                .map(|s| s.split_from_previous > 1)
                .unwrap_or(false);
            if needs_split {
                job.status = JobStatus::NeedsSplit;
                return None;
            }
            // Direct advance: last stage's output becomes next stage's input.
            job.current_stage = stage + 1;
            for t in job.tiles.iter_mut().filter(|t| t.is_active()) {
                if let Some(url) = t.stage_outputs.get(&stage).cloned() {
                    t.input_url = url;
                }
            }
            Some(stage + 1)
        })?;

        if let Some(next_stage) = next {
            info!("job {} advancing to stage {}", job_id, next_stage);
            self.dispatch_pending(job_id, next_stage).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Re-split between stages
    // -----------------------------------------------------------------------

    async fn perform_splits(&self, job_id: &str) -> Result<(), UpscaleError> {
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status != JobStatus::NeedsSplit {
            return Ok(());
        }
        let stage = snap.current_stage;
        let next_stage = stage + 1;
        let next_cfg = snap.plan.config.stage(next_stage).cloned();
        let next_mult = next_cfg.as_ref().map(|s| s.scale_multiplier).unwrap_or(4);

        struct ParentSplit {
            parent_id: u64,
            children: Vec<(TileRegion, u32, u32, String)>,
        }
        let mut splits: Vec<ParentSplit> = Vec::new();
        let mut decode_failures: Vec<(u64, String)> = Vec::new();
        let mut passthrough: Vec<(u64, String)> = Vec::new();

        for tile in snap
            .active_tiles()
            .filter(|t| t.status != TileStatus::Failed)
        {
            let Some(output_url) = tile.output_for(stage) else {
                continue;
            };
            let bytes = self.blobs.fetch(output_url).await?;
            let img = match image::load_from_memory(&bytes) {
                Ok(i) => i.to_rgb8(),
                Err(e) => {
                    // Left unsplit and flagged; the barrier policy decides job
                    // fate.
                    decode_failures
                        .push((tile.tile_id, format!("split decode failed: {}", e)));
                    continue;
                }
            };
            let factor = match &next_cfg {
                Some(s) => s.split_from_previous,
                None => {
                    let derived =
                        derive_split_from_overflow(img.width(), img.height(), next_mult);
                    warn!(
                        "job {} tile {}: plan metadata missing, derived split {} from observed {}x{}",
                        job_id, tile.tile_id, derived, img.width(), img.height()
                    );
                    derived
                }
            };
            if factor <= 1 {
                passthrough.push((tile.tile_id, output_url.to_string()));
                continue;
            }
            let g = split_grid(factor);
            let parent_region = tile.region();
            let mut children = Vec::new();
            for (idx, child) in child_regions(&parent_region, factor, snap.overlap)
                .iter()
                .enumerate()
            {
                let crop = crop_child(&img, &parent_region, child)?;
                let png = encode_rgb(&crop, OutputFormat::Png)?;
                let url = self
                    .blobs
                    .put(
                        &format!(
                            "jobs/{}/stage{}/tile-{}-{}.png",
                            job_id, next_stage, tile.tile_id, idx
                        ),
                        png,
                        "image/png",
                    )
                    .await?;
                children.push((*child, idx as u32, g, url));
            }
            splits.push(ParentSplit {
                parent_id: tile.tile_id,
                children,
            });
        }

        // Atomic commit: the job is never advanced against a half-updated
        // tile list.
        let committed = self.store.with_job(job_id, |job| {
            if job.status != JobStatus::NeedsSplit || job.current_stage != stage {
                return false;
            }
            for (tile_id, reason) in &decode_failures {
                if let Some(t) = job.tile_mut(*tile_id) {
                    t.status = TileStatus::Failed;
                    t.error = Some(reason.clone());
                }
            }
            for (tile_id, url) in &passthrough {
                if let Some(t) = job.tile_mut(*tile_id) {
                    t.input_url = url.clone();
                }
            }
            for split in &splits {
                for (region, idx, g, url) in &split.children {
                    let id = job.mint_tile_id();
                    let mut rec = TileRecord::new(id, *region, url.clone());
                    rec.parent_tile_id = Some(split.parent_id);
                    rec.sub_tile_index = Some(*idx);
                    rec.sub_tile_grid = Some(*g);
                    job.tiles.push(rec);
                }
                if let Some(parent) = job.tile_mut(split.parent_id) {
                    parent.superseded = true;
                }
            }
            job.current_stage = next_stage;
            job.status = JobStatus::Processing;
            true
        })?;

        if committed {
            let children: usize = splits.iter().map(|s| s.children.len()).sum();
            info!(
                "job {} stage {} -> {}: split {} tiles into {} (+{} passthrough)",
                job_id, stage, next_stage, splits.len(), children, passthrough.len()
            );
            self.dispatch_pending(job_id, next_stage).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalize — stitch all final-stage outputs
    // -----------------------------------------------------------------------

    async fn finalize(&self, job_id: &str) -> Result<(), UpscaleError> {
        let snap = self
            .store
            .snapshot(job_id)
            .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;
        if snap.status != JobStatus::TilesReady {
            return Ok(());
        }
        let final_stage = snap.total_stages();

        let mut loads: Vec<(u64, TileRegion, Option<Bytes>)> = Vec::new();
        for tile in snap.active_tiles() {
            if tile.status == TileStatus::Failed {
                // Accepted by the partial-success policy; region is filled
                // explicitly by the stitcher.
                loads.push((tile.tile_id, tile.region(), None));
                continue;
            }
            let Some(url) = tile.output_for(final_stage) else {
                return self.fail_job(
                    job_id,
                    &format!("stitch: tile {} has no final output", tile.tile_id),
                );
            };
            match self.blobs.fetch(url).await {
                Ok(bytes) => loads.push((tile.tile_id, tile.region(), Some(bytes))),
                Err(e) => {
                    return self.fail_job(
                        job_id,
                        &format!("stitch: tile {} failed to load: {}", tile.tile_id, e),
                    );
                }
            }
        }

        let params = StitchParams {
            input_width: snap.plan.input_width,
            input_height: snap.plan.input_height,
            stitch_scale: snap.plan.config.cumulative_multiplier(),
            target_width: snap.original_width * snap.target_scale,
            target_height: snap.original_height * snap.target_scale,
            overlap: snap.overlap,
            filter: self.policy.final_filter,
        };
        let format = snap.settings.output_format;

        // Decode and composite off the async runtime.
        let stitched = tokio::task::spawn_blocking(move || {
            let tiles: Result<Vec<StitchTile>, UpscaleError> = loads
                .into_par_iter()
                .map(|(tile_id, region, bytes)| match bytes {
                    None => Ok(StitchTile {
                        tile_id,
                        region,
                        image: None,
                    }),
                    Some(b) => {
                        let img = image::load_from_memory(&b)
                            .map_err(|e| {
                                UpscaleError::Stitch(format!(
                                    "tile {} failed to decode: {}",
                                    tile_id, e
                                ))
                            })?
                            .to_rgb8();
                        Ok(StitchTile {
                            tile_id,
                            region,
                            image: Some(img),
                        })
                    }
                })
                .collect();
            let out = stitch(tiles?, &params)?;
            encode_rgb(&out, format)
        })
        .await
        .map_err(|e| UpscaleError::Stitch(format!("stitch task panicked: {}", e)))?;

        let encoded = match stitched {
            Ok(b) => b,
            Err(e) => {
                let msg = e.to_string();
                self.fail_job(job_id, &msg)?;
                return Err(e);
            }
        };

        let url = self
            .blobs
            .put(
                &format!("jobs/{}/final.{}", job_id, format.extension()),
                encoded,
                format.content_type(),
            )
            .await?;

        self.store.with_job(job_id, |job| {
            if job.status != JobStatus::TilesReady {
                return;
            }
            job.final_output_url = Some(url.clone());
            job.status = if job.degraded {
                JobStatus::PartialSuccess
            } else {
                JobStatus::Completed
            };
            info!("job {} {:?}: {}", job.job_id, job.status, url);
        })?;
        Ok(())
    }

    fn fail_job(&self, job_id: &str, message: &str) -> Result<(), UpscaleError> {
        warn!("job {} failed: {}", job_id, message);
        self.store.with_job(job_id, |job| {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(message.to_string());
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Partial-success policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierPolicy {
    Fail,
    Degrade,
}

/// The one place that decides whether failed tiles sink the job: degrade only
/// if at least one tile succeeded and the failed fraction stays within the
/// configured limit.
fn barrier_decision(
    active: usize,
    failed: usize,
    succeeded: usize,
    frac_limit: f64,
) -> BarrierPolicy {
    if succeeded == 0 {
        return BarrierPolicy::Fail;
    }
    if active == 0 || failed as f64 / active as f64 > frac_limit {
        return BarrierPolicy::Fail;
    }
    BarrierPolicy::Degrade
}

/// Encode an RGB image to the requested container.
pub fn encode_rgb(img: &RgbImage, format: OutputFormat) -> Result<Bytes, UpscaleError> {
    let mut buf = Vec::new();
    let out = match format {
        OutputFormat::Png => image::DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png),
        OutputFormat::Jpeg => image::DynamicImage::ImageRgb8(img.clone()).write_to(
            &mut Cursor::new(&mut buf),
            image::ImageOutputFormat::Jpeg(JPEG_QUALITY),
        ),
    };
    out.map_err(|e| UpscaleError::Decode(format!("encode: {}", e)))?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_decision_thresholds() {
        // 1 of 4 failed at the default 0.25 limit: degrade.
        assert_eq!(barrier_decision(4, 1, 3, 0.25), BarrierPolicy::Degrade);
        // 2 of 4: over the limit.
        assert_eq!(barrier_decision(4, 2, 2, 0.25), BarrierPolicy::Fail);
        // Nothing succeeded: always fail.
        assert_eq!(barrier_decision(4, 4, 0, 0.25), BarrierPolicy::Fail);
        assert_eq!(barrier_decision(0, 0, 0, 0.25), BarrierPolicy::Fail);
    }

    #[test]
    fn test_dispatch_marker_ages_but_prediction_ids_do_not() {
        let fresh = dispatch_marker();
        assert!(is_dispatch_marker(&fresh));
        let age = marker_age_secs(&fresh).unwrap();
        assert!(age < STALE_MARKER_SECS, "fresh marker already stale: {}", age);

        let old = format!(
            "{}:{}",
            DISPATCH_MARKER,
            chrono::Utc::now().timestamp() - 600
        );
        assert!(marker_age_secs(&old).unwrap() >= STALE_MARKER_SECS);

        assert!(!is_dispatch_marker("mock-17"));
        assert_eq!(marker_age_secs("mock-17"), None);
    }

    #[test]
    fn test_encode_rgb_png_roundtrip() {
        let img = RgbImage::from_pixel(5, 4, image::Rgb([1, 2, 3]));
        let bytes = encode_rgb(&img, OutputFormat::Png).unwrap();
        let back = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!((back.width(), back.height()), (5, 4));
        assert_eq!(back.get_pixel(0, 0).0, [1, 2, 3]);
    }
}
