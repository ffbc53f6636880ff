mod config;
mod crew;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod product_url;
mod security;
mod tools;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use config::Settings;
use crew::{ListingOutput, extract::extract_listing};
use eyre::WrapErr;
use idempotency::IdempotencyStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ExtractRequest, GenerateRequest, GenerateTextResponse, ListingResponse};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use product_url::{canonical_product_url, extract_asin, normalize_url};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tools::{PageScraper, ScrapedPage};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "listing-crew", version, about = "Product listing copy from a product URL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the crew once for a URL and print the listing as JSON.
    Generate { url: String },
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        error!(target = "listing.api", "fatal: {err:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let settings = Settings::from_env().wrap_err("loading configuration")?;
    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Generate { url } => generate_once(&settings, &url).await,
        Command::Serve { port } => serve(settings, port).await,
    }
}

async fn generate_once(settings: &Settings, url: &str) -> eyre::Result<()> {
    let pipeline = Pipeline::new(settings);
    let output = pipeline
        .generate_listing(url)
        .await
        .wrap_err_with(|| format!("generating listing for {url}"))?;
    if output.is_fallback() {
        warn!(target = "listing.api", "model output was not valid JSON; printing raw text");
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn serve(settings: Settings, port: Option<u16>) -> eyre::Result<()> {
    let pipeline = Pipeline::new(&settings);
    let (queue, _worker) = jobs::JobQueue::spawn(
        pipeline.clone(),
        jobs::queue_capacity_from_env(),
        jobs::retained_jobs_from_env(),
    );
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyStore::from_env(),
        prometheus_handle,
        scraper: PageScraper::new(&settings.http),
    };
    let app = router(state, AuthState::from_env(), body_limit_from_env());

    let port = port.unwrap_or(settings.port);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "listing.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
    scraper: PageScraper,
}

fn router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/api/v1/generate_text", post(generate_text))
        .route("/listings", post(create_listing))
        .nest(
            "/stages",
            Router::new()
                .route("/normalize_url", post(stage_normalize_url))
                .route("/scrape_page", post(stage_scrape_page))
                .route("/extract", post(stage_extract)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/listings", post(enqueue_listing_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml")).unwrap_or_else(|err| {
        warn!(target = "listing.api", error = %err, "openapi document unreadable");
        json!({"openapi": "3.0.3"})
    })
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-crew-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> impl IntoResponse {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Listing Crew API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    ([("Content-Type", "text/html; charset=utf-8")], html)
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Generate listing copy for a product URL.
///
/// - Method: `POST`
/// - Path: `/api/v1/generate_text`
/// - Auth: `Authorization: Bearer <key>` or `X-Listing-Key: <key>`
/// - Body: `{"url": "..."}`
/// - Response: `GenerateTextResponse`; replays the stored response when the
///   same `Idempotency-Key` was seen before for this org.
async fn generate_text(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateTextResponse>, AppError> {
    crate::metrics::inc_requests("/api/v1/generate_text");
    info!(
        target = "listing.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        url = %payload.url,
        "generate_text invoked",
    );

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|key| IdempotencyStore::scoped_key(&context.org_id, key));

    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.get::<GenerateTextResponse>(key).await
    {
        info!(target = "listing.api", org_id = %context.org_id, "idempotent replay");
        return Ok(Json(existing));
    }

    let response = state.pipeline.run(&payload.url).await?;
    let Some(body) = GenerateTextResponse::from_listing(&response) else {
        crate::metrics::fallback_output("/api/v1/generate_text");
        return Err(AppError::unstructured(&response.output));
    };

    if let Some(key) = &idempotency_key {
        state.idempotency.put(key, &body).await;
    }
    Ok(Json(body))
}

/// Run the crew and return the full transcript.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Body: `{"url": "..."}`
/// - Response: `ListingResponse`; `output` may be the raw envelope.
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<ListingResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    info!(
        target = "listing.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        "listing pipeline invoked",
    );
    let response = state.pipeline.run(&payload.url).await?;
    if response.output.is_fallback() {
        crate::metrics::fallback_output("/listings");
    }
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct NormalizeUrlResponse {
    url: String,
    asin: Option<String>,
    canonical_url: String,
}

async fn stage_normalize_url(
    Json(req): Json<GenerateRequest>,
) -> Result<Json<NormalizeUrlResponse>, AppError> {
    crate::metrics::inc_requests("/stages/normalize_url");
    let url = validated_url(&req.url)?;
    Ok(Json(NormalizeUrlResponse {
        asin: extract_asin(&url),
        canonical_url: canonical_product_url(&url),
        url,
    }))
}

async fn stage_scrape_page(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<ScrapedPage>, AppError> {
    crate::metrics::inc_requests("/stages/scrape_page");
    let url = validated_url(&req.url)?;
    let page = state
        .scraper
        .fetch(&url)
        .await
        .map_err(|err| AppError::Upstream {
            error: "scrape_failed",
            detail: err.to_string(),
        })?;
    Ok(Json(page))
}

async fn stage_extract(Json(req): Json<ExtractRequest>) -> Json<ListingOutput> {
    crate::metrics::inc_requests("/stages/extract");
    Json(extract_listing(&req.raw))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_listing_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/listings");
    let url = validated_url(&payload.url)?;
    let id = state
        .queue
        .enqueue_listing(url, context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

fn validated_url(raw: &str) -> Result<String, AppError> {
    normalize_url(raw).map_err(|err| {
        AppError::Pipeline(PipelineError::invalid_input("normalize_url", err.to_string()))
    })
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Upstream { error: &'static str, detail: String },
    NotFound(&'static str),
    Unauthorized(&'static str),
}

impl AppError {
    fn unstructured(output: &ListingOutput) -> Self {
        let detail = match output {
            ListingOutput::Raw { raw_output } => raw_output.clone(),
            ListingOutput::Structured(_) => String::new(),
        };
        AppError::Upstream {
            error: "unstructured_output",
            detail,
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::RetriesExhausted => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, payload)
            }
            AppError::Upstream { error, detail } => (
                StatusCode::BAD_GATEWAY,
                ApiError {
                    error: error.to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".into(),
                    detail: Some(format!("{what} not found")),
                },
            ),
            AppError::Unauthorized(what) => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: "unauthorized".into(),
                    detail: Some(format!("{what} requires a key")),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
