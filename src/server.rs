//! HTTP API: upload validation, job bookkeeping and the composite endpoint.
//!
//! Tool work blocks on child processes, so it runs on Tokio's blocking pool
//! behind a semaphore that caps how many composites run at once.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::compositor::{runnable_strategies, CompositeRequest, Compositor};
use crate::config::Config;
use crate::error::ApiError;
use crate::job::{CompositeJob, UploadInfo};
use crate::layers::LayerReport;
use crate::store::JobStore;
use crate::strategy::Strategy;
use crate::telemetry;
use crate::tools::ToolStatus;
use crate::validation::{self, ImageKind};

pub const JOB_ID_HEADER: &str = "x-job-id";
pub const STRATEGY_HEADER: &str = "x-composite-strategy";

/// Room for multipart boundaries and the small text fields.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub compositor: Arc<Compositor>,
    pub store: JobStore,
    pub permits: Arc<Semaphore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(compositor: Compositor, store: JobStore, config: Config) -> Self {
        Self {
            compositor: Arc::new(compositor),
            store,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes * 2 + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/composite", post(composite))
        .route("/api/layers", post(layers))
        .route("/api/jobs/:job_id", get(job_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive().expose_headers([
            HeaderName::from_static(JOB_ID_HEADER),
            HeaderName::from_static(STRATEGY_HEADER),
            header::CONTENT_DISPOSITION,
        ]))
        .with_state(state)
}

/// Binds the listener and serves until `shutdown` is cancelled.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Compositor API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Compositor API stopped");
    Ok(())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub strategies: Vec<Strategy>,
    pub tools: Vec<ToolStatus>,
}

/// `GET /api/health`: service status and which tools are installed.
///
/// Reports `degraded` when no strategy has all of its tools.
async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let compositor = state.compositor.clone();
    let tools = tokio::task::spawn_blocking(move || compositor.tool_status()).await?;
    let strategies = runnable_strategies(&tools);

    Ok(Json(HealthResponse {
        status: if strategies.is_empty() { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        strategies,
        tools,
    }))
}

/// A file field pulled out of the multipart body.
struct Upload {
    file_name: String,
    bytes: Bytes,
}

/// Fields accepted by the composite and layers endpoints.
#[derive(Default)]
struct CompositeForm {
    template: Option<Upload>,
    artwork: Option<Upload>,
    layer_name: Option<String>,
    dpi: Option<String>,
    strategy: Option<String>,
}

impl CompositeForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = CompositeForm::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "template" | "artwork" => {
                    let file_name = field
                        .file_name()
                        .map(validation::sanitize_filename)
                        .unwrap_or_else(|| name.clone());
                    let upload = Upload {
                        file_name,
                        bytes: field.bytes().await?,
                    };
                    if name == "template" {
                        form.template = Some(upload);
                    } else {
                        form.artwork = Some(upload);
                    }
                }
                "layer_name" => form.layer_name = Some(field.text().await?),
                "dpi" => form.dpi = Some(field.text().await?),
                "strategy" => form.strategy = Some(field.text().await?),
                other => warn!(field = other, "Ignoring unknown multipart field"),
            }
        }

        Ok(form)
    }
}

/// Validated inputs for one composite.
struct ValidatedComposite {
    template: Upload,
    artwork: Upload,
    artwork_kind: ImageKind,
    layer_name: String,
    dpi: u32,
    strategy: Option<Strategy>,
}

fn validate_composite(form: CompositeForm, config: &Config) -> Result<ValidatedComposite, ApiError> {
    let limit = config.max_upload_bytes;
    validation::check_upload("template", form.template.as_ref().map(|u| &u.bytes[..]), limit)?;
    validation::check_upload("artwork", form.artwork.as_ref().map(|u| &u.bytes[..]), limit)?;

    let (Some(template), Some(artwork)) = (form.template, form.artwork) else {
        return Err(ApiError::BadRequest("template and artwork are required".to_string()));
    };

    validation::check_template(&template.bytes)?;
    let artwork_kind = validation::check_artwork(&artwork.bytes)?;

    Ok(ValidatedComposite {
        template,
        artwork,
        artwork_kind,
        layer_name: validation::normalize_layer_name(
            form.layer_name.as_deref(),
            &config.default_layer_name,
        )?,
        dpi: validation::parse_dpi(form.dpi.as_deref(), config.default_dpi)?,
        strategy: validation::parse_strategy(form.strategy.as_deref())?,
    })
}

/// `POST /api/composite`: returns the composited PDF.
///
/// Multipart fields: `template` (PDF), `artwork` (image), and optional
/// `layer_name`, `dpi`, `strategy`. Once the job exists every response,
/// failures included, carries its id in `X-Job-Id`.
async fn composite(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let form = CompositeForm::read(multipart).await?;
    let input = validate_composite(form, &state.config)?;

    let mut job = CompositeJob::new(
        input.layer_name.clone(),
        input.dpi,
        input.strategy,
        UploadInfo {
            file_name: input.template.file_name.clone(),
            content_type: "application/pdf".to_string(),
            size_bytes: input.template.bytes.len() as u64,
        },
        UploadInfo {
            file_name: input.artwork.file_name.clone(),
            content_type: input.artwork_kind.mime().to_string(),
            size_bytes: input.artwork.bytes.len() as u64,
        },
    );
    save_job(&state.store, &job).await;

    info!(
        job_id = %job.job_id,
        layer = %job.layer_name,
        dpi = job.dpi,
        template_bytes = job.template.size_bytes,
        artwork_bytes = job.artwork.size_bytes,
        "Composite job accepted"
    );

    let response = match run_composite(&state, &mut job, input).await {
        Ok((strategy, pdf)) => pdf_response(&job, strategy, pdf),
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, "Composite job failed");
            if !job.is_terminal() {
                job.mark_failed(e.to_string(), Vec::new());
            }
            let mut response = e.into_response();
            insert_job_id(&mut response, &job.job_id);
            response
        }
    };

    save_job(&state.store, &job).await;
    telemetry::record_job_telemetry(&job);
    Ok(response)
}

/// Everything after the job record exists. Marks the job complete, or failed
/// with its attempts when the cascade gives up.
async fn run_composite(
    state: &AppState,
    job: &mut CompositeJob,
    input: ValidatedComposite,
) -> Result<(Strategy, Vec<u8>), ApiError> {
    let _permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    job.start_processing();
    save_job(&state.store, job).await;

    let job_dir = tempfile::Builder::new()
        .prefix("job-")
        .tempdir_in(&state.config.work_dir)?;

    let request = CompositeRequest {
        template: job_dir.path().join("template.pdf"),
        artwork: job_dir
            .path()
            .join(format!("artwork.{}", input.artwork_kind.extension())),
        output: job_dir.path().join("composited.pdf"),
        layer_name: input.layer_name,
        dpi: input.dpi,
        strategy: input.strategy,
    };
    tokio::fs::write(&request.template, &input.template.bytes).await?;
    tokio::fs::write(&request.artwork, &input.artwork.bytes).await?;

    let compositor = state.compositor.clone();
    let blocking_request = request.clone();
    let result = tokio::task::spawn_blocking(move || compositor.composite(&blocking_request)).await?;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            job.mark_failed(e.to_string(), e.attempts().to_vec());
            return Err(e.into());
        }
    };

    let pdf = tokio::fs::read(&request.output).await?;
    job.mark_complete(&outcome);
    Ok((outcome.strategy, pdf))
}

fn insert_job_id(response: &mut Response, job_id: &str) {
    if let Ok(value) = HeaderValue::from_str(job_id) {
        response.headers_mut().insert(JOB_ID_HEADER, value);
    }
}

fn pdf_response(job: &CompositeJob, strategy: Strategy, pdf: Vec<u8>) -> Response {
    let stem = Path::new(&job.template.file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("template");
    let disposition = format!("attachment; filename=\"{}-composited.pdf\"", stem.replace('"', ""));

    let mut response = (StatusCode::OK, pdf).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(STRATEGY_HEADER, HeaderValue::from_static(strategy.as_str()));
    insert_job_id(&mut response, &job.job_id);
    response
}

/// `POST /api/layers`: lists the template's layers.
///
/// Multipart fields: `template` (PDF) and optional `layer_name` to look up.
async fn layers(State(state): State<AppState>, multipart: Multipart) -> Result<Json<LayerReport>, ApiError> {
    let form = CompositeForm::read(multipart).await?;
    let limit = state.config.max_upload_bytes;
    validation::check_upload("template", form.template.as_ref().map(|u| &u.bytes[..]), limit)?;
    let template = form
        .template
        .ok_or_else(|| ApiError::BadRequest("template is required".to_string()))?;
    validation::check_template(&template.bytes)?;
    let target = validation::normalize_layer_name(
        form.layer_name.as_deref(),
        &state.config.default_layer_name,
    )?;

    let dir = tempfile::Builder::new()
        .prefix("layers-")
        .tempdir_in(&state.config.work_dir)?;
    let path = dir.path().join("template.pdf");
    tokio::fs::write(&path, &template.bytes).await?;

    let compositor = state.compositor.clone();
    let report = tokio::task::spawn_blocking(move || compositor.inspect_layers(&path, &target)).await??;

    info!(
        file = %template.file_name,
        layers = report.layers.len(),
        target_found = report.target_found,
        "Listed template layers"
    );
    Ok(Json(report))
}

/// `GET /api/jobs/:job_id`: the stored job record.
async fn job_status(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<CompositeJob>, ApiError> {
    let job = state
        .store
        .get(&job_id)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;

    job.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", job_id)))
}

/// Job records are advisory; a store outage must not fail the composite.
async fn save_job(store: &JobStore, job: &CompositeJob) {
    if let Err(e) = store.save(job).await {
        error!(job_id = %job.job_id, "Failed to store job record: {:#}", e);
    }
}
