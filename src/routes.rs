use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    cmi::ScormVersion,
    config::AppConfig,
    error::{StoreError, SyncError},
    models::*,
    package::PackageError,
    player,
    runtime::LaunchConfig,
    storage::DirStorage,
    store::Store,
};

/// Characters escaped in content URLs; `%` is left alone because manifest
/// hrefs may already be encoded.
const HREF: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'\'').add(b'<').add(b'>').add(b'`');

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<AppConfig>,
}

/// The full service: API routes plus health check and HTTP middleware.
pub fn app(state: AppState) -> Router {
    let limit = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(router(state))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

pub fn router(state: AppState) -> Router {
    let static_dir = state.config.data_dir.clone();
    Router::new()
        // packages
        .route("/api/units/:unit_id/packages", post(upload_package))
        .route("/api/packages/:package_id", get(get_package))
        .route("/api/packages/:package_id/reprocess", post(reprocess_package))
        // launch
        .route("/api/units/:unit_id/learners/:learner_id/launch", get(launch))
        .route("/player/:unit_id/:learner_id", get(player_shell))
        // tracking
        .route(
            "/api/units/:unit_id/learners/:learner_id/progress",
            post(sync_progress).get(legacy_progress),
        )
        .route("/api/units/:unit_id/learners/:learner_id/enrollment", get(enrollment))
        .route("/api/units/:unit_id/learners/:learner_id/reset", post(reset_enrollment))
        // static content (serves extracted package files)
        .nest_service("/content", ServeDir::new(static_dir))
        .with_state(state)
}

async fn upload_package(
    State(st): State<AppState>,
    Path(unit_id): Path<Uuid>,
    mut mp: Multipart,
) -> ApiResult<Package> {
    let mut title = None;
    let mut zip_bytes: Option<Vec<u8>> = None;

    while let Some(field) = mp.next_field().await.map_err(|e| e400(e.to_string()))? {
        let name = field.name().unwrap_or("").to_string();
        if name == "title" {
            title = Some(field.text().await.map_err(|e| e400(e.to_string()))?);
        } else if name == "file" {
            zip_bytes = Some(field.bytes().await.map_err(|e| e400(e.to_string()))?.to_vec());
        }
    }
    let bytes = zip_bytes.ok_or_else(|| e400("file is required"))?;

    let mut package = Package::new(unit_id, title.unwrap_or_default(), String::new(), Utc::now());
    package.base_path = format!("packages/{}", package.id);
    st.store.insert_package(&package).await.map_err(store_error)?;

    let out_dir = st.config.data_dir.join(&package.base_path);
    let package = tokio::task::spawn_blocking(move || {
        package
            .ingest(&bytes, &out_dir, Utc::now())
            .map(|_| package)
    })
    .await
    .map_err(e500)?
    .map_err(package_error)?;

    st.store.save_package(&package).await.map_err(store_error)?;
    Ok(Json(package))
}

async fn get_package(State(st): State<AppState>, Path(package_id): Path<Uuid>) -> ApiResult<Package> {
    st.store
        .package(package_id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| e404("package not found"))
}

async fn reprocess_package(State(st): State<AppState>, Path(package_id): Path<Uuid>) -> ApiResult<Package> {
    let mut package = st
        .store
        .package(package_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| e404("package not found"))?;
    package.reset(Utc::now()).map_err(package_error)?;
    st.store.save_package(&package).await.map_err(store_error)?;

    let files = DirStorage::new(st.config.data_dir.join(&package.base_path));
    let package = tokio::task::spawn_blocking(move || package.process(&files, Utc::now()).map(|_| package))
        .await
        .map_err(e500)?
        .map_err(package_error)?;

    st.store.save_package(&package).await.map_err(store_error)?;
    Ok(Json(package))
}

async fn launch(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
    Query(q): Query<LaunchQuery>,
    headers: HeaderMap,
) -> ApiResult<LaunchConfig> {
    let origin = public_origin(&st.config, &headers);
    launch_config(&st, &origin, unit_id, learner_id, q.fresh).await.map(Json)
}

/// Origin the runtime posts commits to: the configured public URL, else the
/// Host the request came in on.
fn public_origin(config: &AppConfig, headers: &HeaderMap) -> String {
    if let Some(url) = &config.public_url {
        return url.clone();
    }
    match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{host}"),
        None => format!("http://localhost:{}", config.port),
    }
}

async fn launch_config(
    st: &AppState,
    origin: &str,
    unit_id: Uuid,
    learner_id: String,
    fresh: bool,
) -> Result<LaunchConfig, (StatusCode, String)> {
    let package = st
        .store
        .ready_package(unit_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| e404("unit has no ready package"))?;
    let entry = package
        .entry_point_href
        .as_deref()
        .ok_or_else(|| e500("ready package without entry point"))?;

    let (enrollment, prior) = st
        .store
        .launch(&learner_id, unit_id, fresh)
        .await
        .map_err(store_error)?;
    tracing::info!(
        learner_id = %learner_id,
        unit_id = %unit_id,
        status = %enrollment.enrollment_status,
        resume = prior.is_some(),
        fresh,
        "launch"
    );

    let learner_segment = utf8_percent_encode(&learner_id, NON_ALPHANUMERIC).to_string();
    Ok(LaunchConfig {
        session_id: Uuid::new_v4(),
        scorm_version: package.scorm_version.unwrap_or(ScormVersion::Scorm12),
        sync_url: format!("{origin}/api/units/{unit_id}/learners/{learner_segment}/progress"),
        content_url: Some(format!(
            "/content/{}/{}",
            package.base_path,
            utf8_percent_encode(entry, HREF)
        )),
        learner_id,
        learner_name: None,
        prior,
        settings: st.config.runtime.clone(),
    })
}

async fn player_shell(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
    Query(q): Query<LaunchQuery>,
    headers: HeaderMap,
) -> Result<Html<String>, (StatusCode, String)> {
    let origin = public_origin(&st.config, &headers);
    let config = launch_config(&st, &origin, unit_id, learner_id, q.fresh).await?;
    player::render(&config).map(Html).map_err(e500)
}

async fn sync_progress(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
    payload: Result<Json<CommitRequest>, JsonRejection>,
) -> ApiResult<SyncResponse> {
    let Json(req) = payload.map_err(|e| e422(e.body_text()))?;
    let resp = st
        .store
        .sync(&learner_id, unit_id, &req, &st.config.completion)
        .await
        .map_err(sync_error)?;
    tracing::debug!(
        learner_id = %learner_id,
        unit_id = %unit_id,
        session_id = %req.session_id,
        sequence = req.sequence_number,
        applied = resp.applied,
        completed = resp.progress.completed,
        "progress synced"
    );
    Ok(Json(resp))
}

async fn legacy_progress(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
) -> ApiResult<LegacyProgress> {
    st.store
        .legacy_progress(&learner_id, unit_id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| e404("no progress recorded"))
}

async fn enrollment(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
) -> ApiResult<EnrollmentDetail> {
    st.store
        .enrollment(&learner_id, unit_id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| e404("enrollment not found"))
}

async fn reset_enrollment(
    State(st): State<AppState>,
    Path((unit_id, learner_id)): Path<(Uuid, String)>,
) -> ApiResult<Enrollment> {
    let enrollment = st
        .store
        .reset_enrollment(&learner_id, unit_id)
        .await
        .map_err(store_error)?;
    tracing::info!(learner_id = %learner_id, unit_id = %unit_id, "enrollment reset");
    Ok(Json(enrollment))
}

// --- helpers ---
fn e400<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn e404<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, msg.into())
}

fn e422<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::UNPROCESSABLE_ENTITY, msg.into())
}

fn e500<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn store_error(e: StoreError) -> (StatusCode, String) {
    match e.status() {
        StatusCode::INTERNAL_SERVER_ERROR => e500(e),
        status => (status, e.to_string()),
    }
}

fn sync_error(e: SyncError) -> (StatusCode, String) {
    match e.status() {
        StatusCode::INTERNAL_SERVER_ERROR => e500(e),
        status => (status, e.to_string()),
    }
}

fn package_error(e: PackageError) -> (StatusCode, String) {
    match e {
        PackageError::Lifecycle { .. } => (StatusCode::CONFLICT, e.to_string()),
        e => e500(e),
    }
}
