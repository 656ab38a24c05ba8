use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use clap::Args;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use sysinfo::System;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::ResampleFilter;
use crate::error::UpscaleError;
use crate::inference::ReplicateClient;
use crate::job::{JobSettings, JobStatus, JobStore, OutputFormat};
use crate::orchestrator::{Orchestrator, PolicyConfig, ResumeTile};
use crate::recovery::{spawn_sweeper, JobWatcher, WatchConfig};
use crate::storage::{content_type_for_key, LocalBlobStore};

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Root for job records and blob storage.
    #[arg(long, default_value = "data")]
    data_root: PathBuf,
    /// Public base URL under which this server's /blobs routes are reachable
    /// by the inference backend.
    #[arg(long, default_value = "http://localhost:8080")]
    public_base_url: String,
    #[arg(long, default_value = "https://api.replicate.com")]
    replicate_api_base: String,
    #[arg(long, env = "REPLICATE_API_TOKEN")]
    replicate_token: Option<String>,
    /// Model version hash passed on every prediction create.
    #[arg(long, default_value = "real-esrgan-4x")]
    model_version: String,
    /// End-to-end timeout on each backend HTTP call; keep below the staleness
    /// thresholds so a hung connection cannot stall the watcher.
    #[arg(long, default_value_t = 30)]
    backend_timeout_secs: u64,
    /// Filter for the stitcher's final exact-dimension resize.
    #[arg(long, default_value_t = ResampleFilter::Lanczos3)]
    final_resample: ResampleFilter,
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,
    #[arg(long, default_value_t = 10)]
    stale_polls: u32,
    #[arg(long, default_value_t = 30)]
    grace_secs: u64,
    #[arg(long, default_value_t = 600)]
    job_timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[arg(long, default_value_t = 0.25)]
    max_failed_tile_fraction: f64,
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
    #[arg(long, default_value_t = 2048)]
    cache_entries: u64,
    #[arg(long, default_value_t = 8)]
    dispatch_concurrency: usize,
    #[arg(long, default_value_t = 8)]
    tokio_workers: usize,
    #[arg(long, default_value_t = 32)]
    tokio_blocking_threads: usize,
    #[arg(long, default_value_t = 30)]
    metrics_interval_secs: u64,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    store: Arc<JobStore>,
    blobs: Arc<LocalBlobStore>,
    watch: WatchConfig,
    metrics: Arc<Mutex<Metrics>>,
}

#[derive(Deserialize)]
struct CreateQuery {
    scale: u32,
    format: Option<String>,
}

#[derive(Deserialize)]
struct ResumeRequest {
    stage: u32,
    tiles: Vec<ResumeTile>,
}

#[derive(Default, Clone)]
struct Metrics {
    jobs_created: u64,
    jobs_completed: u64,
    jobs_partial: u64,
    jobs_failed: u64,
    job_ms_sum: u128,
    job_ms_max: u128,
    blob_reads: u64,
}

impl Metrics {
    fn record_job(&mut self, status: JobStatus, ms: u128) {
        match status {
            JobStatus::Completed => self.jobs_completed += 1,
            JobStatus::PartialSuccess => self.jobs_partial += 1,
            _ => self.jobs_failed += 1,
        }
        self.job_ms_sum += ms;
        if ms > self.job_ms_max {
            self.job_ms_max = ms;
        }
    }

    fn take(&mut self) -> Metrics {
        let snapshot = self.clone();
        *self = Metrics::default();
        snapshot
    }
}

pub fn run(args: ServeArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.tokio_workers)
        .max_blocking_threads(args.tokio_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: ServeArgs) -> Result<()> {
    let token = args
        .replicate_token
        .clone()
        .ok_or_else(|| anyhow!("no API token; set --replicate-token or REPLICATE_API_TOKEN"))?;

    let store = Arc::new(JobStore::open(&args.data_root)?);
    let blobs = Arc::new(LocalBlobStore::open(
        &args.data_root,
        &args.public_base_url,
        args.cache_entries,
    )?);
    let backend = Arc::new(ReplicateClient::new(
        &args.replicate_api_base,
        &token,
        &args.model_version,
        Duration::from_secs(args.backend_timeout_secs),
    )?);
    let policy = PolicyConfig {
        max_retries: args.max_retries,
        max_failed_tile_fraction: args.max_failed_tile_fraction,
        job_timeout: Duration::from_secs(args.job_timeout_secs),
        dispatch_concurrency: args.dispatch_concurrency,
        final_filter: args.final_resample,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        backend,
        blobs.clone(),
        policy,
    ));
    let watch = WatchConfig {
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        stale_polls: args.stale_polls,
        stale_grace: Duration::from_secs(args.grace_secs),
        timeout: Duration::from_secs(args.job_timeout_secs),
    };

    let in_flight = store.in_flight();
    if !in_flight.is_empty() {
        info!("resuming {} in-flight jobs from disk", in_flight.len());
    }
    spawn_sweeper(
        orchestrator.clone(),
        store.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    );

    let state = AppState {
        orchestrator,
        store,
        blobs,
        watch,
        metrics: Arc::new(Mutex::new(Metrics::default())),
    };

    if args.metrics_interval_secs > 0 {
        let metrics = state.metrics.clone();
        let store = state.store.clone();
        let interval = Duration::from_secs(args.metrics_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = metrics.lock().take();
                let in_flight = store.in_flight().len();
                if snapshot.jobs_created == 0
                    && snapshot.jobs_completed + snapshot.jobs_partial + snapshot.jobs_failed == 0
                    && in_flight == 0
                {
                    continue;
                }
                let finished =
                    snapshot.jobs_completed + snapshot.jobs_partial + snapshot.jobs_failed;
                let job_avg = if finished > 0 {
                    snapshot.job_ms_sum / finished as u128
                } else {
                    0
                };
                let mut sys = System::new();
                let (rss_kb, cpu_pct) = if let Ok(pid) = sysinfo::get_current_pid() {
                    sys.refresh_process(pid);
                    sys.process(pid)
                        .map(|p| (p.memory(), p.cpu_usage()))
                        .unwrap_or((0, 0.0))
                } else {
                    (0, 0.0)
                };
                info!(
                    "metrics jobs_created={} completed={} partial={} failed={} in_flight={} job_avg_ms={} job_max_ms={} blob_reads={} rss_kb={} cpu_pct={:.1}",
                    snapshot.jobs_created,
                    snapshot.jobs_completed,
                    snapshot.jobs_partial,
                    snapshot.jobs_failed,
                    in_flight,
                    job_avg,
                    snapshot.job_ms_max,
                    snapshot.blob_reads,
                    rss_kb,
                    cpu_pct
                );
            }
        });
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/jobs", post(create_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/resume", post(resume_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
        .route("/blobs/*key", get(get_blob))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.port);
    info!(
        "listening on http://{} (tokio_workers={}, tokio_blocking_threads={}, hw_threads={})",
        addr,
        args.tokio_workers,
        args.tokio_blocking_threads,
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0)
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn create_job(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    body: Bytes,
) -> Result<Response, Response> {
    let format = match query.format.as_deref() {
        Some(s) => s.parse::<OutputFormat>().map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, &e)
        })?,
        None => OutputFormat::Png,
    };
    let settings = JobSettings {
        scale: query.scale,
        output_format: format,
    };
    let job_id = state
        .orchestrator
        .create_job(body, settings)
        .await
        .map_err(to_http_error)?;
    state.metrics.lock().jobs_created += 1;

    // Drive the job in the background; clients track it via GET /jobs/:id.
    let orchestrator = state.orchestrator.clone();
    let watch = state.watch.clone();
    let metrics = state.metrics.clone();
    let watched_id = job_id.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        let watcher = JobWatcher::new(orchestrator, watch);
        let outcome = watcher.wait(&watched_id, None).await;
        let ms = start.elapsed().as_millis();
        match outcome {
            Ok(status) => {
                metrics.lock().record_job(status, ms);
                info!("job {} finished {:?} ms={}", watched_id, status, ms);
            }
            Err(e) => {
                metrics.lock().record_job(JobStatus::Failed, ms);
                info!("job {} watcher error: {}", watched_id, e);
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Response, Response> {
    let snap = state
        .store
        .snapshot(&job_id)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "job not found"))?;
    let body = json!({
        "job_id": snap.job_id,
        "status": snap.status,
        "progress": snap.progress(),
        "current_stage": snap.current_stage,
        "total_stages": snap.total_stages(),
        "scale": snap.target_scale,
        "template": snap.plan.template_name,
        "degraded": snap.degraded,
        "final_output_url": snap.final_output_url,
        "error": snap.error,
    });
    Ok(Json(body).into_response())
}

async fn resume_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Response, Response> {
    state
        .orchestrator
        .resume(&job_id, req.stage, req.tiles)
        .map_err(to_http_error)?;
    Ok(Json(json!({ "job_id": job_id, "status": "processing" })).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Response, Response> {
    state.orchestrator.cancel(&job_id).map_err(to_http_error)?;
    Ok(Json(json!({ "job_id": job_id, "status": "failed" })).into_response())
}

async fn get_blob(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
) -> Result<Response, Response> {
    let bytes = state
        .blobs
        .read_key(&key)
        .map_err(|_| error_response(StatusCode::NOT_FOUND, "blob not found"))?;
    state.metrics.lock().blob_reads += 1;
    let mut resp = Response::new(bytes.into());
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_key(&key)),
    );
    Ok(resp)
}

fn to_http_error(err: UpscaleError) -> Response {
    let status = match &err {
        UpscaleError::NotFound(_) => StatusCode::NOT_FOUND,
        UpscaleError::InvalidState(_) => StatusCode::CONFLICT,
        UpscaleError::Planning(_) | UpscaleError::Decode(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
