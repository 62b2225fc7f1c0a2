//! HTTP surface of the catalog.
//!
//! [`AppState`] is built once at start-up and cloned into every handler; it
//! owns the settings and the two derivative pipelines. Handlers translate
//! [`MediaError`]s into JSON `{ "mensaje": ... }` bodies and never leak
//! filesystem paths or tool output.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::task;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, warn};
use urlencoding::encode;

use crate::{
    catalog::{self, CatalogVideo},
    config::Settings,
    derivative::{DerivativeCache, Playable},
    error::MediaError,
    naming::{is_safe_segment, optimized_name, thumbnail_name},
    streaming::{VIDEO_CONTENT_TYPE, serve_file},
    thumbnail::ThumbnailGenerator,
    tools::{FfmpegTools, Remuxer, Thumbnailer},
};

const NO_CATEGORIES: &str = "No se encontraron categorías.";
const NO_VIDEOS: &str = "No se encontraron videos.";
const NO_CATEGORY_VIDEOS: &str = "No se encontraron videos para esta categoría.";
const VIDEO_NOT_FOUND: &str = "Video no encontrado.";
const THUMBNAIL_NOT_FOUND: &str = "Miniatura no encontrada.";
const RESOURCE_NOT_FOUND: &str = "Recurso no encontrado";

/// Shared state injected into every Axum handler.
#[derive(Clone)]
pub struct AppState {
    settings: Arc<Settings>,
    derivatives: DerivativeCache,
    thumbnails: ThumbnailGenerator,
}

impl AppState {
    pub fn new(
        settings: Settings,
        remuxer: Arc<dyn Remuxer>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        let derivatives =
            DerivativeCache::new(remuxer, settings.remux_timeout, settings.build_retry);
        let thumbnails = ThumbnailGenerator::new(
            thumbnailer,
            settings.thumbnail_timeout,
            settings.build_retry,
        );
        Self {
            settings: Arc::new(settings),
            derivatives,
            thumbnails,
        }
    }

    /// State backed by the `ffmpeg` binary named in the settings.
    pub fn with_ffmpeg(settings: Settings) -> Self {
        let tools = Arc::new(FfmpegTools::new(settings.ffmpeg.clone()));
        Self::new(settings, tools.clone(), tools)
    }

    fn video_url(&self, category: &str, file_name: &str) -> String {
        format!(
            "{}/videos/{}/{}",
            self.settings.public_url,
            encode(category),
            encode(file_name)
        )
    }

    fn thumbnail_url(&self, category: &str, file_name: &str) -> String {
        format!(
            "{}/thumbnails/{}/{}",
            self.settings.public_url,
            encode(category),
            encode(file_name)
        )
    }

    /// Turns catalog videos into listing entries and kicks off any missing
    /// thumbnails. Thumbnail URLs are returned whether or not the image exists
    /// yet.
    fn listing(&self, videos: Vec<CatalogVideo>) -> Vec<VideoListingEntry> {
        videos
            .into_iter()
            .map(|video| {
                let thumb = thumbnail_name(&video.file_name);
                let dest_dir = self.settings.thumbnails_root.join(&video.category);
                self.thumbnails.ensure(&video.path, &dest_dir, &thumb);
                VideoListingEntry {
                    url: self.video_url(&video.category, &video.file_name),
                    thumbnail: self.thumbnail_url(&video.category, &thumb),
                    titulo: video.title,
                    fecha: video.modified_ms,
                }
            })
            .collect()
    }
}

/// One logical video as exposed by the listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoListingEntry {
    pub titulo: String,
    pub url: String,
    pub thumbnail: String,
    /// Source modification time in milliseconds since the epoch.
    pub fecha: u64,
}

#[derive(Debug, Serialize)]
struct IpInfo {
    ip: String,
    puerto: u16,
    url: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    headers: HeaderMap,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Maps a component error onto the HTTP taxonomy. `missing` is the message
    /// used for `NotFound`.
    fn from_media(err: MediaError, missing: &str) -> Self {
        match err {
            MediaError::NotFound(what) => {
                debug!(%what, "not found");
                Self::not_found(missing)
            }
            MediaError::InvalidRange { size } => {
                let mut api =
                    Self::new(StatusCode::RANGE_NOT_SATISFIABLE, "Rango no satisfacible.");
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    api.headers.insert(header::CONTENT_RANGE, value);
                }
                api
            }
            MediaError::BuildFailed { target, reason } => {
                error!(video = %target, %reason, "optimization failed");
                Self::internal("No se pudo optimizar el video.")
            }
            MediaError::BuildTimedOut { target } => {
                error!(video = %target, "optimization timed out");
                Self::internal("La optimización del video tardó demasiado.")
            }
            MediaError::Io(err) => {
                error!(%err, "I/O error while serving a request");
                Self::internal("Error interno del servidor.")
            }
            MediaError::Http(err) => {
                error!(%err, "could not build response");
                Self::internal("Error interno del servidor.")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "mensaje": self.message,
        });
        (self.status, self.headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/ip", get(api_ip))
        .route("/api/categorias", get(list_categories))
        .route("/api/videos", get(list_all_videos))
        .route("/api/videos/", get(list_all_videos))
        .route("/api/videos/{categoria}", get(list_category_videos))
        .route("/videos/{categoria}/{nombre}", get(stream_video))
        .route("/thumbnails/{categoria}/{archivo}", get(download_thumbnail))
        .fallback(fallback)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "¡API de Videos funcionando!"
}

async fn api_ip(State(state): State<AppState>) -> Json<IpInfo> {
    let public_url = &state.settings.public_url;
    Json(IpInfo {
        ip: host_of(public_url).to_string(),
        puerto: state.settings.port,
        url: format!("{public_url}/api/"),
    })
}

async fn fallback() -> ApiError {
    ApiError::not_found(RESOURCE_NOT_FOUND)
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    let root = state.settings.videos_root.clone();
    let categories = task::spawn_blocking(move || catalog::list_categories(&root))
        .await
        .map_err(join_error)?;
    if categories.is_empty() {
        return Err(ApiError::not_found(NO_CATEGORIES));
    }
    Ok(Json(categories))
}

async fn list_all_videos(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<VideoListingEntry>>> {
    let entries = task::spawn_blocking(move || {
        let root = &state.settings.videos_root;
        let mut videos: Vec<CatalogVideo> = catalog::list_categories(root)
            .iter()
            .flat_map(|category| catalog::list_videos(root, category))
            .collect();
        catalog::sort_newest_first(&mut videos);
        state.listing(videos)
    })
    .await
    .map_err(join_error)?;

    if entries.is_empty() {
        return Err(ApiError::not_found(NO_VIDEOS));
    }
    Ok(Json(entries))
}

async fn list_category_videos(
    State(state): State<AppState>,
    AxumPath(categoria): AxumPath<String>,
) -> ApiResult<Json<Vec<VideoListingEntry>>> {
    let entries = task::spawn_blocking(move || {
        let videos = catalog::list_videos(&state.settings.videos_root, &categoria);
        state.listing(videos)
    })
    .await
    .map_err(join_error)?;

    if entries.is_empty() {
        return Err(ApiError::not_found(NO_CATEGORY_VIDEOS));
    }
    Ok(Json(entries))
}

/// Plays a video, building its optimized variant on first request. The
/// request that waited for a build is redirected to the optimized name.
async fn stream_video(
    State(state): State<AppState>,
    AxumPath((categoria, nombre)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_segment(&categoria) || !is_safe_segment(&nombre) {
        return Err(ApiError::not_found(VIDEO_NOT_FOUND));
    }
    let source = state.settings.videos_root.join(&categoria).join(&nombre);

    let playable = state
        .derivatives
        .ensure_playable(&source)
        .await
        .map_err(|err| ApiError::from_media(err, VIDEO_NOT_FOUND))?;

    let path = match playable {
        Playable::Built(_) => {
            let optimized = optimized_name(&nombre).unwrap_or(nombre);
            let location = format!("/videos/{}/{}", encode(&categoria), encode(&optimized));
            return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
        }
        Playable::Unoptimized(path) => {
            warn!(%categoria, %nombre, "serving video without fast-start");
            path
        }
        Playable::Ready(path) => path,
    };

    serve_file(&path, VIDEO_CONTENT_TYPE, headers.get(header::RANGE))
        .await
        .map_err(|err| ApiError::from_media(err, VIDEO_NOT_FOUND))
}

async fn download_thumbnail(
    State(state): State<AppState>,
    AxumPath((categoria, archivo)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_segment(&categoria) || !is_safe_segment(&archivo) {
        return Err(ApiError::not_found(THUMBNAIL_NOT_FOUND));
    }
    let path = state
        .settings
        .thumbnails_root
        .join(&categoria)
        .join(&archivo);
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();

    serve_file(&path, mime.as_ref(), headers.get(header::RANGE))
        .await
        .map_err(|err| ApiError::from_media(err, THUMBNAIL_NOT_FOUND))
}

fn join_error(err: task::JoinError) -> ApiError {
    error!(%err, "catalog task failed");
    ApiError::internal("Error interno del servidor.")
}

/// Host part of an absolute URL such as `http://192.168.1.6:3000`.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.starts_with('[') {
        return authority
            .split_once(']')
            .map_or(authority, |(host, _)| host.trim_start_matches('['));
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}
