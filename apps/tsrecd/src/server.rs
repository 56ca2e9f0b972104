// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The recording HTTP surface.
//!
//! Everything mounts under `/api/recording`. Audio and waveform downloads
//! support byte ranges and suffix ranges; the currently open segment can be
//! followed live: the two Ogg header pages are sent first, then pages are
//! forwarded as the recorder appends them, polling every 250 ms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, DuplexStream, SeekFrom};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tsrec_audio::ogg;
use tsrec_audio::waveform;
use tsrec_index::{DeleteOutcome, ListFilter};

use crate::state::AppState;

const AUDIO_CONTENT_TYPE: &str = "audio/ogg";
const WAVEFORM_CONTENT_TYPE: &str = "application/octet-stream";

/// Poll interval while following the open segment.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Read chunk for streaming and following.
const STREAM_BUF_SIZE: usize = 16 * 1024;

/// Builds the engine, recovers orphans, and serves the API until ctrl-c.
///
/// # Errors
///
/// Returns an error when the configuration is invalid or the listener cannot
/// bind.
pub async fn run(config: &crate::config::Config, config_path: &str) -> anyhow::Result<()> {
    let config_dir = Path::new(config_path).parent().unwrap_or_else(|| Path::new("."));
    let recorder_config = config.recording.recorder_config(config.bot.id, config_dir)?;

    std::fs::create_dir_all(&recorder_config.root)?;
    let index = std::sync::Arc::new(tsrec_index::RecordingIndex::open(
        &recorder_config.root.join("recordings.db"),
    )?);

    // Orphans from a previous crash are finalized before anything starts.
    let recovered = tsrec_engine::recovery::recover_orphans(
        &recorder_config.root,
        &index,
        &tsrec_engine::recovery::RecoveryOptions {
            bot_id: recorder_config.bot_id,
            min_duration: recorder_config.min_duration,
            max_total_size: recorder_config.max_total_size,
        },
    );
    if recovered > 0 {
        tracing::info!(recovered, "crash recovery finished");
    }

    let source = std::sync::Arc::new(crate::state::DetachedChannelSource);
    let recorder = tsrec_engine::Recorder::new(recorder_config, index, source);
    recorder.spawn_tick();

    let state = AppState::new(recorder.clone());
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.address).await?;
    tracing::info!(address = %config.server.address, "recording API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    recorder.dispose();
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/recording/status", get(status_handler))
        .route("/api/recording/enable", post(enable_handler))
        .route("/api/recording/list", get(list_handler))
        .route("/api/recording/users", get(users_handler))
        .route("/api/recording/delete/{*id}", delete(delete_handler))
        .route("/api/recording/get/{*id}", get(get_recording_handler))
        .route("/api/recording/waveform/{uid}/{*id}", get(waveform_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

// --- Status and control ---

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.recorder.status())
}

#[derive(Deserialize)]
struct EnableRequest {
    enabled: bool,
}

async fn enable_handler(
    State(state): State<AppState>,
    Json(request): Json<EnableRequest>,
) -> impl IntoResponse {
    state.recorder.set_enabled(request.enabled);
    Json(state.recorder.status())
}

// --- Listing ---

#[derive(Deserialize, Default)]
struct ListQuery {
    from: Option<String>,
    to: Option<String>,
    uid: Option<String>,
    name: Option<String>,
}

/// Accepts RFC 3339 instants or bare `YYYY-MM-DD` dates.
fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn parse_optional_instant(
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, (StatusCode, String)> {
    match raw {
        None => Ok(None),
        Some(value) => parse_instant(value)
            .map(Some)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("invalid instant: {value}"))),
    }
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let filter = ListFilter {
        from: parse_optional_instant(query.from.as_deref())?,
        to: parse_optional_instant(query.to.as_deref())?,
        uid: query.uid,
        name: query.name,
    };
    let rows = state
        .recorder
        .list(&filter)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows))
}

async fn users_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let from = parse_optional_instant(query.from.as_deref())?;
    let to = parse_optional_instant(query.to.as_deref())?;
    let users = state
        .recorder
        .list_participants(from, to)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(users))
}

async fn delete_handler(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    match state.recorder.delete(&id) {
        Ok(DeleteOutcome::Deleted) => Json(true).into_response(),
        Ok(DeleteOutcome::NotFound) => {
            (StatusCode::NOT_FOUND, "no such recording").into_response()
        },
        Ok(DeleteOutcome::RefusedOpen) => {
            (StatusCode::CONFLICT, "recording is currently open").into_response()
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- Streaming ---

async fn get_recording_handler(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(path) = resolve_in_root(&state.root, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    if range.is_none() && state.recorder.is_current_open(&id) {
        return follow_response(state, path, id);
    }
    serve_file_range(&path, AUDIO_CONTENT_TYPE, range).await
}

async fn waveform_handler(
    State(state): State<AppState>,
    UrlPath((uid, id)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(audio_path) = resolve_in_root(&state.root, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(base) = audio_path.file_stem().and_then(|s| s.to_str()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let sidecar = audio_path.with_file_name(waveform::track_file_name(base, &uid));
    if !sidecar.exists() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    serve_file_range(&sidecar, WAVEFORM_CONTENT_TYPE, range).await
}

/// Resolves a recording id inside the root, rejecting path escapes: the
/// canonicalized target must stay under the canonicalized root.
fn resolve_in_root(root: &Path, id: &str) -> Option<PathBuf> {
    if id.contains('\\') {
        return None;
    }
    let joined = root.join(id);
    let canonical = joined.canonicalize().ok()?;
    if canonical.starts_with(root) && canonical != *root {
        Some(canonical)
    } else {
        None
    }
}

fn base_headers(content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers
}

/// A `Range: bytes=…` request, before clamping against the file length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `bytes=S-` or `bytes=S-E`.
    Bounded(u64, Option<u64>),
    /// `bytes=-N`: the final N bytes.
    Suffix(u64),
}

fn parse_range(raw: &str) -> Option<RangeSpec> {
    let spec = raw.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None; // multipart ranges unsupported
    }
    if let Some(suffix) = spec.strip_prefix('-') {
        return suffix.parse().ok().map(RangeSpec::Suffix);
    }
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start: u64 = start_raw.trim().parse().ok()?;
    let end = end_raw.trim();
    if end.is_empty() {
        Some(RangeSpec::Bounded(start, None))
    } else {
        end.parse().ok().map(|e| RangeSpec::Bounded(start, Some(e)))
    }
}

/// Clamps a range against the file length; `None` is unsatisfiable.
fn resolve_range(spec: RangeSpec, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    match spec {
        RangeSpec::Bounded(start, end) => {
            if start >= len {
                return None;
            }
            let end = end.map_or(len - 1, |e| e.min(len - 1));
            (start <= end).then_some((start, end))
        },
        RangeSpec::Suffix(n) => {
            if n == 0 {
                return None;
            }
            Some((len.saturating_sub(n), len - 1))
        },
    }
}

async fn serve_file_range(path: &Path, content_type: &str, range: Option<&str>) -> Response {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "stat failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        },
    };

    let mut headers = base_headers(content_type);
    let Some(raw_range) = range else {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_BUF_SIZE));
        return (StatusCode::OK, headers, body).into_response();
    };

    match parse_range(raw_range).and_then(|spec| resolve_range(spec, len)) {
        Some((start, end)) => {
            if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                tracing::warn!("range seek failed: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let span = end - start + 1;
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(span));
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let body = Body::from_stream(ReaderStream::with_capacity(
                file.take(span),
                STREAM_BUF_SIZE,
            ));
            (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
        },
        None => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
        },
    }
}

/// Live-follow response for the currently open segment.
fn follow_response(state: AppState, path: PathBuf, file_id: String) -> Response {
    let (writer, reader) = tokio::io::duplex(STREAM_BUF_SIZE);
    tokio::spawn(async move {
        // The loop ends when the segment closes or the client goes away
        // (writes into the dropped duplex fail).
        if let Err(e) = follow_loop(&state, &path, &file_id, writer).await {
            tracing::debug!(file_id, "live follow ended: {e}");
        }
    });

    let headers = base_headers(AUDIO_CONTENT_TYPE);
    let body = Body::from_stream(ReaderStream::with_capacity(reader, STREAM_BUF_SIZE));
    (StatusCode::OK, headers, body).into_response()
}

/// Emits the two Ogg header pages, seeks to the current end, then forwards
/// appended bytes, sleeping 250 ms whenever the reader catches up.
async fn follow_loop(
    state: &AppState,
    path: &Path,
    file_id: &str,
    mut writer: DuplexStream,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;

    let mut head = vec![0u8; STREAM_BUF_SIZE];
    let n = file.read(&mut head).await?;
    head.truncate(n);
    if let Some(header_len) = ogg::header_pages_len(&head) {
        writer.write_all(&head[..header_len]).await?;
        writer.flush().await?;
    }

    file.seek(SeekFrom::End(0)).await?;
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            if !state.recorder.is_current_open(file_id) {
                break;
            }
            tokio::time::sleep(FOLLOW_POLL).await;
            continue;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::state::DetachedChannelSource;
    use axum::body::to_bytes;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;
    use tsrec_engine::{Recorder, RecorderConfig};
    use tsrec_index::RecordingIndex;

    fn test_state(root: &Path) -> (AppState, Arc<RecordingIndex>) {
        let index = Arc::new(RecordingIndex::open_in_memory().unwrap());
        let recorder = Recorder::new(
            RecorderConfig {
                bot_id: 1,
                root: root.to_path_buf(),
                enabled: false,
                bitrate_kbps: 48,
                stop_delay: Duration::from_secs(30),
                min_duration: Duration::ZERO,
                max_total_size: None,
                exclude_uids: Vec::new(),
            },
            index.clone(),
            Arc::new(DetachedChannelSource),
        );
        (AppState::new(recorder), index)
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-"), Some(RangeSpec::Bounded(0, None)));
        assert_eq!(parse_range("bytes=5-9"), Some(RangeSpec::Bounded(5, Some(9))));
        assert_eq!(parse_range("bytes=-10"), Some(RangeSpec::Suffix(10)));
        assert_eq!(parse_range("bytes = 0-1"), None);
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
        assert_eq!(parse_range("items=0-1"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
    }

    #[test]
    fn test_resolve_range_bounds() {
        // bytes=0- on a 100-byte file
        assert_eq!(resolve_range(RangeSpec::Bounded(0, None), 100), Some((0, 99)));
        // bytes=-10 on a 100-byte file
        assert_eq!(resolve_range(RangeSpec::Suffix(10), 100), Some((90, 99)));
        // suffix longer than the file clamps to the whole file
        assert_eq!(resolve_range(RangeSpec::Suffix(500), 100), Some((0, 99)));
        // start past the end is unsatisfiable
        assert_eq!(resolve_range(RangeSpec::Bounded(200, None), 100), None);
        // inverted range is unsatisfiable
        assert_eq!(resolve_range(RangeSpec::Bounded(9, Some(5)), 100), None);
        // end clamps to the file
        assert_eq!(resolve_range(RangeSpec::Bounded(50, Some(1000)), 100), Some((50, 99)));
    }

    #[test]
    fn test_resolve_in_root_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let day = root.join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("a.opus"), b"x").unwrap();
        std::fs::write(dir.path().parent().unwrap().join("outside.opus"), b"x").ok();

        assert!(resolve_in_root(&root, "2026-03-01/a.opus").is_some());
        assert!(resolve_in_root(&root, "../outside.opus").is_none());
        assert!(resolve_in_root(&root, "2026-03-01/../../outside.opus").is_none());
        assert!(resolve_in_root(&root, "").is_none(), "the root itself is not a recording");
        assert!(resolve_in_root(&root, "missing.opus").is_none());
    }

    #[tokio::test]
    async fn test_status_and_enable_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _index) = test_state(dir.path());
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/recording/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["enabled"], false);
        assert_eq!(status["active"], false);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/recording/enable")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"enabled\":true}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["enabled"], true);
    }

    #[tokio::test]
    async fn test_get_recording_range_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _index) = test_state(dir.path());
        let day = state.root.join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("10-00-00__10-01-00.opus"), vec![7u8; 100]).unwrap();
        let app = build_router(state);

        let request = |range: Option<&str>| {
            let mut builder = axum::http::Request::builder()
                .uri("/api/recording/get/2026-03-01/10-00-00__10-01-00.opus");
            if let Some(range) = range {
                builder = builder.header(header::RANGE, range);
            }
            builder.body(Body::empty()).unwrap()
        };

        // Full download.
        let response = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/ogg");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 100);

        // Suffix range.
        let response = app.clone().oneshot(request(Some("bytes=-10"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 90-99/100");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");

        // Open-ended range.
        let response = app.clone().oneshot(request(Some("bytes=0-"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-99/100");

        // Unsatisfiable range.
        let response = app.clone().oneshot(request(Some("bytes=200-"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */100");

        // Escape attempt.
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/recording/get/..%2F..%2Fetc%2Fpasswd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_waveform_endpoint_serves_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _index) = test_state(dir.path());
        let day = state.root.join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("10-00-00__10-01-00.opus"), b"audio").unwrap();
        std::fs::write(day.join("10-00-00__10-01-00__mixed.wfm"), vec![1u8; 20]).unwrap();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/recording/waveform/mixed/2026-03-01/10-00-00__10-01-00.opus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/octet-stream");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 20);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/recording/waveform/nobody/2026-03-01/10-00-00__10-01-00.opus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_endpoint_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (state, index) = test_state(dir.path());
        let day = state.root.join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("10-00-00__10-01-00.opus"), b"audio").unwrap();

        let now = Utc::now();
        index
            .insert(&tsrec_core::types::RecordingInfo {
                id: "2026-03-01/10-00-00__10-01-00.opus".to_string(),
                bot_id: 1,
                file_id: "2026-03-01/10-00-00__10-01-00.opus".to_string(),
                file_name: "10-00-00__10-01-00.opus".to_string(),
                start: now,
                end: Some(now),
                size_bytes: 5,
                duration_ms: Some(60_000),
                is_open: false,
                participants: vec![],
                waveforms: vec![],
                created: now,
                updated: now,
            })
            .unwrap();
        let app = build_router(state);

        let request = || {
            axum::http::Request::builder()
                .method("DELETE")
                .uri("/api/recording/delete/2026-03-01/10-00-00__10-01-00.opus")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!day.join("10-00-00__10-01-00.opus").exists());

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
