//! TUS protocol handler
//!
//! Translates HTTP requests into session manager calls and renders
//! protocol-correct responses.
//!
//! # Supported Endpoints
//!
//! * `OPTIONS {prefix}[/{id}]` - Capability discovery
//! * `POST {prefix}` - Create an upload (optionally with a first chunk)
//! * `PATCH {prefix}/{id}` - Append a chunk at `Upload-Offset`
//! * `HEAD {prefix}/{id}` - Report offset and length
//! * `DELETE {prefix}/{id}` - Terminate an upload
//! * `POST /finalize` - Re-run the completion hook for a finished upload
//! * `GET /health` - Health check (returns "ok")
//! * `GET /metrics` - Prometheus metrics, when enabled

use crate::config::Config;
use crate::metrics;
use crate::protocol::{self, UploadMetadata};
use crate::router::{RouterError, TusOperation, TusRequestParser};
use crate::upload::{SessionManager, SessionStatus, UploadError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http_body_util::BodyStream;
use hyper::body::Body;
use hyper::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::http::response::Builder;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use serde::Deserialize;
use tracing::{error, info, warn, Instrument};

/// Manual finalization endpoint, outside the upload collection
pub const FINALIZE_PATH: &str = "/finalize";

const FINALIZE_BODY_LIMIT: usize = 16 * 1024;

/// Shared state handed to every request
pub struct AppState {
    sessions: Arc<SessionManager>,
    router: TusRequestParser,
    /// `{base_url}{prefix}`, the stem of every `Location`
    location_base: String,
    cors: bool,
    metrics_enabled: bool,
}

impl AppState {
    pub fn new(config: &Config, sessions: Arc<SessionManager>) -> Self {
        let location_base = format!(
            "{}{}",
            config.tus.base_url.as_deref().unwrap_or_default(),
            config.tus.prefix
        );

        Self {
            sessions,
            router: TusRequestParser::new(config.tus.prefix.clone()),
            location_base,
            cors: config.server.cors,
            metrics_enabled: config.metrics.enabled,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// `Location` of upload `id`
    fn location(&self, id: &str) -> String {
        format!("{}/{}", self.location_base, id)
    }
}

/// Body of `POST /finalize`
#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    upload_id: String,
    /// Name handed to the hook instead of the upload's `name` metadata
    #[serde(default)]
    filename: Option<String>,
}

/// Handle HTTP request
///
/// Never fails at the transport level: every outcome, including internal
/// errors, is rendered as an HTTP response.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<String>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    let start = Instant::now();
    let method = effective_method(&req);
    let path = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http.request",
        http.method = %method,
        http.target = %path,
        http.status_code = tracing::field::Empty,
        otel.kind = "server",
    );

    async move {
        let response = route(req, &method, &path, &state).await;
        let status = response.status().as_u16();

        tracing::Span::current().record("http.status_code", status);
        metrics::record_request(&method, status, start.elapsed().as_secs_f64());
        info!(status = status, duration_ms = start.elapsed().as_millis(), "Handled {} {}", method, path);

        Ok::<_, Infallible>(response)
    }
    .instrument(span)
    .await
}

/// Request method, honouring `X-HTTP-Method-Override` for TUS methods only
fn effective_method<B>(req: &Request<B>) -> String {
    header_str(req.headers(), protocol::METHOD_OVERRIDE)
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| protocol::TUS_METHODS.contains(&m.as_str()))
        .unwrap_or_else(|| req.method().as_str().to_string())
}

async fn route<B>(req: Request<B>, method: &str, path: &str, state: &AppState) -> Response<String>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    if path == FINALIZE_PATH {
        return if method == Method::POST.as_str() {
            finalize_upload(req, state).await
        } else {
            text(
                tus_response(state, StatusCode::METHOD_NOT_ALLOWED).header("Allow", "POST"),
                format!("{} not allowed on {}", method, FINALIZE_PATH),
            )
        };
    }

    if method == Method::GET.as_str() {
        if path == "/health" {
            return plain_response(StatusCode::OK, "ok");
        }
        if path == "/metrics" && state.metrics_enabled {
            return metrics_response();
        }
    }

    let operation = match state.router.parse(method, path) {
        Ok(Some(op)) => op,
        Ok(None) => return plain_response(StatusCode::NOT_FOUND, "Not Found"),
        Err(RouterError::InvalidPath(reason)) => {
            return text(tus_response(state, StatusCode::NOT_FOUND), reason)
        }
        Err(RouterError::MethodNotAllowed(reason)) => {
            return text(
                tus_response(state, StatusCode::METHOD_NOT_ALLOWED)
                    .header("Allow", protocol::ALLOWED_METHODS),
                reason,
            )
        }
    };

    if operation != TusOperation::Discover {
        let version = header_str(req.headers(), protocol::TUS_RESUMABLE);
        if version != Some(protocol::TUS_VERSION) {
            warn!(client_version = ?version, "Unsupported Tus-Resumable version");
            return text(
                tus_response(state, StatusCode::PRECONDITION_FAILED)
                    .header(protocol::TUS_VERSION_HEADER, protocol::TUS_VERSION),
                "Unsupported or missing Tus-Resumable header",
            );
        }
    }

    match operation {
        TusOperation::Discover => discover(state),
        TusOperation::Create => create_upload(req, state).await,
        TusOperation::Append { id } => append_chunk(req, &id, state).await,
        TusOperation::Status { id } => upload_status(&id, state).await,
        TusOperation::Terminate { id } => terminate_upload(&id, state).await,
    }
}

/// OPTIONS: advertise protocol capabilities
fn discover(state: &AppState) -> Response<String> {
    let mut builder = tus_response(state, StatusCode::NO_CONTENT)
        .header(protocol::TUS_VERSION_HEADER, protocol::TUS_VERSION)
        .header(protocol::TUS_EXTENSION, protocol::TUS_EXTENSIONS);

    if state.cors {
        builder = builder
            .header("Access-Control-Allow-Methods", protocol::ALLOWED_METHODS)
            .header("Access-Control-Allow-Headers", protocol::ALLOWED_HEADERS)
            .header("Access-Control-Max-Age", "86400");
    }

    empty(builder)
}

/// POST: create an upload, optionally storing the request body as its first chunk
async fn create_upload<B>(req: Request<B>, state: &AppState) -> Response<String>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;

    let declared_length = match (
        header_str(headers, protocol::UPLOAD_LENGTH),
        header_str(headers, protocol::UPLOAD_DEFER_LENGTH),
    ) {
        (Some(length), None) => match protocol::parse_byte_count(length) {
            Some(length) => Some(length),
            None => return bad_request(state, "Invalid Upload-Length"),
        },
        (None, Some("1")) => None,
        (None, Some(_)) => return bad_request(state, "Upload-Defer-Length must be 1"),
        (Some(_), Some(_)) => {
            return bad_request(
                state,
                "Upload-Length and Upload-Defer-Length are mutually exclusive",
            )
        }
        (None, None) => {
            return bad_request(state, "Upload-Length or Upload-Defer-Length is required")
        }
    };

    let metadata = match header_str(headers, protocol::UPLOAD_METADATA) {
        Some(raw) => match UploadMetadata::parse(raw) {
            Ok(metadata) => metadata,
            Err(e) => return bad_request(state, &format!("Invalid Upload-Metadata: {}", e)),
        },
        None => UploadMetadata::new(),
    };

    let with_upload = is_offset_stream(headers);

    let created = match state.sessions.create_session(declared_length, metadata).await {
        Ok(status) => status,
        Err(e) => {
            let response = error_response(state, &e);
            // A zero-length upload exists even when its hook failed
            return match &e {
                UploadError::FinalizationError { id, .. } => {
                    with_location(response, &state.location(id))
                }
                _ => response,
            };
        }
    };
    let location = state.location(&created.id);

    let mut current = created;
    if with_upload {
        match state
            .sessions
            .append_chunk(&current.id, 0, payload_stream(body), None)
            .await
        {
            Ok(status) => current = status,
            Err(
                e @ (UploadError::FinalizationError { .. } | UploadError::StorageError(_)),
            ) => {
                return with_location(error_response(state, &e), &location);
            }
            // The upload exists; report what was kept so the client resumes with PATCH
            Err(e) => {
                warn!(upload.id = %current.id, error = %e, "Initial chunk rejected");
                metrics::record_error(e.kind());
            }
        }
    }

    info!(upload.id = %current.id, location = %location, "Upload created");

    let mut builder = tus_response(state, StatusCode::CREATED).header(LOCATION, location);
    if with_upload {
        builder = builder.header(protocol::UPLOAD_OFFSET, current.offset.to_string());
    }
    empty(with_expiry(builder, &current))
}

/// PATCH: append a chunk at the client-asserted offset
async fn append_chunk<B>(req: Request<B>, id: &str, state: &AppState) -> Response<String>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;

    if !is_offset_stream(headers) {
        return text(
            tus_response(state, StatusCode::UNSUPPORTED_MEDIA_TYPE),
            format!("Content-Type must be {}", protocol::OFFSET_OCTET_STREAM),
        );
    }

    let Some(offset) = header_str(headers, protocol::UPLOAD_OFFSET).and_then(protocol::parse_byte_count)
    else {
        return bad_request(state, "Missing or invalid Upload-Offset");
    };

    let declares_length = match header_str(headers, protocol::UPLOAD_LENGTH) {
        Some(raw) => match protocol::parse_byte_count(raw) {
            Some(length) => Some(length),
            None => return bad_request(state, "Invalid Upload-Length"),
        },
        None => None,
    };

    match state
        .sessions
        .append_chunk(id, offset, payload_stream(body), declares_length)
        .await
    {
        Ok(status) => {
            let builder = tus_response(state, StatusCode::NO_CONTENT)
                .header(protocol::UPLOAD_OFFSET, status.offset.to_string());
            empty(with_expiry(builder, &status))
        }
        Err(e) => error_response(state, &e),
    }
}

/// HEAD: report the committed offset and length
async fn upload_status(id: &str, state: &AppState) -> Response<String> {
    let status = match state.sessions.get_status(id).await {
        Ok(status) => status,
        Err(e) => return error_response(state, &e).map(|_| String::new()),
    };

    let mut builder = tus_response(state, StatusCode::OK)
        .header(protocol::UPLOAD_OFFSET, status.offset.to_string())
        .header(CACHE_CONTROL, "no-store");

    builder = match status.length {
        Some(length) => builder.header(protocol::UPLOAD_LENGTH, length.to_string()),
        None => builder.header(protocol::UPLOAD_DEFER_LENGTH, "1"),
    };

    if !status.metadata.is_empty() {
        builder = builder.header(protocol::UPLOAD_METADATA, status.metadata.encode());
    }

    empty(with_expiry(builder, &status))
}

/// DELETE: terminate an upload
async fn terminate_upload(id: &str, state: &AppState) -> Response<String> {
    match state.sessions.delete_session(id).await {
        Ok(()) => empty(tus_response(state, StatusCode::NO_CONTENT)),
        Err(e) => error_response(state, &e),
    }
}

/// POST /finalize: run the completion hook again for a finished upload
async fn finalize_upload<B>(req: Request<B>, state: &AppState) -> Response<String>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    let body = match read_small_body(payload_stream(req.into_body()), FINALIZE_BODY_LIMIT).await {
        Ok(body) => body,
        Err(reason) => return bad_request(state, &reason),
    };

    let request: FinalizeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(state, &format!("Invalid finalize request: {}", e)),
    };

    if !TusRequestParser::is_valid_id(&request.upload_id) {
        return bad_request(state, "Invalid upload_id");
    }

    match state
        .sessions
        .refinalize(&request.upload_id, request.filename.as_deref())
        .await
    {
        Ok(status) => {
            let body = serde_json::json!({
                "status": "finalized",
                "upload_id": status.id,
                "offset": status.offset,
            });
            tus_response(state, StatusCode::OK)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string())
                .expect("Failed to build finalize response")
        }
        Err(e) => error_response(state, &e),
    }
}

// ============================================================================
// Response helpers
// ============================================================================

/// Response builder carrying the headers every TUS response needs
fn tus_response(state: &AppState, status: StatusCode) -> Builder {
    let mut builder = Response::builder()
        .status(status)
        .header(protocol::TUS_RESUMABLE, protocol::TUS_VERSION);

    if let Some(max) = state.sessions.max_size() {
        builder = builder.header(protocol::TUS_MAX_SIZE, max.to_string());
    }

    if state.cors {
        builder = builder
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Expose-Headers", protocol::EXPOSED_HEADERS);
    }

    builder
}

fn with_expiry(builder: Builder, status: &SessionStatus) -> Builder {
    match status.expires_at {
        Some(at) if !status.completed => {
            builder.header(protocol::UPLOAD_EXPIRES, protocol::http_date(at))
        }
        _ => builder,
    }
}

fn with_location(mut response: Response<String>, location: &str) -> Response<String> {
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn empty(builder: Builder) -> Response<String> {
    builder
        .body(String::new())
        .expect("Failed to build response")
}

fn text(builder: Builder, body: impl Into<String>) -> Response<String> {
    builder
        .header(CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("Failed to build response")
}

fn plain_response(status: StatusCode, body: &str) -> Response<String> {
    text(Response::builder().status(status), body)
}

fn bad_request(state: &AppState, reason: &str) -> Response<String> {
    warn!(reason = reason, "Rejected malformed request");
    metrics::record_error("bad_request");
    text(tus_response(state, StatusCode::BAD_REQUEST), reason)
}

fn metrics_response() -> Response<String> {
    match metrics::render() {
        Ok((content_type, body)) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .expect("Failed to build metrics response"),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

/// Map an upload error onto its protocol status
fn error_response(state: &AppState, err: &UploadError) -> Response<String> {
    let status = match err {
        UploadError::InvalidArgument(_) | UploadError::PayloadInterrupted(_) => {
            StatusCode::BAD_REQUEST
        }
        UploadError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::NotFound(_) => StatusCode::NOT_FOUND,
        UploadError::Expired(_) => StatusCode::GONE,
        UploadError::OffsetConflict { .. } => StatusCode::CONFLICT,
        UploadError::StorageError(_) | UploadError::FinalizationError { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        error!(error = %err, "Upload request failed");
    } else {
        warn!(error = %err, "Upload request rejected");
    }
    metrics::record_error(err.kind());

    let mut builder = tus_response(state, status);
    match err {
        UploadError::OffsetConflict { current, .. } => {
            builder = builder.header(protocol::UPLOAD_OFFSET, current.to_string());
        }
        UploadError::FinalizationError { offset, .. } => {
            builder = builder.header(protocol::UPLOAD_OFFSET, offset.to_string());
        }
        _ => {}
    }

    text(builder, err.to_string())
}

// ============================================================================
// Request helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_offset_stream(headers: &HeaderMap) -> bool {
    header_str(headers, CONTENT_TYPE.as_str())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(protocol::OFFSET_OCTET_STREAM))
}

/// Collect a small request body, refusing anything over `limit` bytes
async fn read_small_body<S>(mut body: S, limit: usize) -> Result<Vec<u8>, String>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut buffer = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| format!("Unreadable body: {}", e))?;
        if buffer.len() + chunk.len() > limit {
            return Err(format!("Body exceeds {} bytes", limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

/// Adapt a request body into the byte stream the chunk writer consumes
fn payload_stream<B>(body: B) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    Box::pin(BodyStream::new(body).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, MetricsConfig, ServerConfig, TusConfig};
    use crate::store::FileMetadataStore;
    use crate::upload::{CompletionHook, HookError};
    use http_body_util::Full;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestEnv {
        state: Arc<AppState>,
        completions: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn test_env(max_size: Option<u64>) -> TestEnv {
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let hook = move |_: &Path, _: &UploadMetadata| -> Result<(), HookError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        build_env(max_size, Arc::new(hook), completions)
    }

    fn failing_env() -> TestEnv {
        let hook = |_: &Path, _: &UploadMetadata| -> Result<(), HookError> {
            Err(HookError("public dir is read-only".into()))
        };
        build_env(None, Arc::new(hook), Arc::new(AtomicUsize::new(0)))
    }

    fn build_env(
        max_size: Option<u64>,
        hook: Arc<dyn CompletionHook>,
        completions: Arc<AtomicUsize>,
    ) -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
                cors: true,
            },
            tus: TusConfig {
                storage_dir: dir.path().to_path_buf(),
                max_size,
                ..TusConfig::default()
            },
            completion: CompletionConfig::default(),
            metrics: MetricsConfig::default(),
        };

        let store = Arc::new(FileMetadataStore::new(dir.path()));
        let sessions = Arc::new(SessionManager::new(&config.tus, store, hook));

        TestEnv {
            state: Arc::new(AppState::new(&config, sessions)),
            completions,
            _dir: dir,
        }
    }

    fn request(method: &str, uri: &str) -> hyper::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(protocol::TUS_RESUMABLE, protocol::TUS_VERSION)
    }

    async fn send(env: &TestEnv, req: Request<Full<Bytes>>) -> Response<String> {
        handle_request(req, env.state.clone()).await.unwrap()
    }

    fn header<'a>(response: &'a Response<String>, name: &str) -> Option<&'a str> {
        header_str(response.headers(), name)
    }

    async fn create(env: &TestEnv, length: u64, metadata: Option<&str>) -> String {
        let mut builder = request("POST", "/files").header(protocol::UPLOAD_LENGTH, length);
        if let Some(metadata) = metadata {
            builder = builder.header(protocol::UPLOAD_METADATA, metadata);
        }
        let response = send(env, builder.body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        header(&response, "location").unwrap().to_string()
    }

    async fn patch(env: &TestEnv, location: &str, offset: u64, data: &'static [u8]) -> Response<String> {
        let req = request("PATCH", location)
            .header(protocol::UPLOAD_OFFSET, offset)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(data)))
            .unwrap();
        send(env, req).await
    }

    #[tokio::test]
    async fn test_options_advertises_capabilities() {
        let env = test_env(Some(1024));
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/files")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
        assert_eq!(header(&response, "tus-max-size"), Some("1024"));
        assert!(header(&response, "tus-extension").unwrap().contains("creation-defer-length"));
        assert!(header(&response, "access-control-allow-methods").is_some());
    }

    #[tokio::test]
    async fn test_create_patch_head_flow() {
        let env = test_env(None);
        // name "a.txt"
        let location = create(&env, 10, Some("name YS50eHQ=")).await;
        assert!(location.starts_with("/files/"));

        let response = patch(&env, &location, 0, b"hello ").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "upload-offset"), Some("6"));
        assert!(header(&response, "upload-expires").is_some());

        let head = send(&env, request("HEAD", &location).body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(header(&head, "upload-offset"), Some("6"));
        assert_eq!(header(&head, "upload-length"), Some("10"));
        assert_eq!(header(&head, "upload-metadata"), Some("name YS50eHQ="));
        assert_eq!(header(&head, "cache-control"), Some("no-store"));
        assert_eq!(env.completions.load(Ordering::SeqCst), 0);

        let response = patch(&env, &location, 6, b"tus!").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "upload-offset"), Some("10"));
        assert_eq!(env.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_patch_conflict_reports_offset() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;

        assert_eq!(patch(&env, &location, 0, b"12345").await.status(), StatusCode::NO_CONTENT);

        let response = patch(&env, &location, 0, b"abcde").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(header(&response, "upload-offset"), Some("5"));
        assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_patch_requires_offset_stream_content_type() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;

        let req = request("PATCH", &location)
            .header(protocol::UPLOAD_OFFSET, 0)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_patch_missing_offset() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;

        let req = request("PATCH", &location)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(b"abc")))
            .unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_tus_resumable_is_precondition_failed() {
        let env = test_env(None);
        let req = Request::builder()
            .method("POST")
            .uri("/files")
            .header(protocol::UPLOAD_LENGTH, 10)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;

        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_create_requires_length() {
        let env = test_env(None);
        let req = request("POST", "/files").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::BAD_REQUEST);

        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, "-1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_metadata() {
        let env = test_env(None);
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, 10)
            .header(protocol::UPLOAD_METADATA, "name !!!")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_over_max_size() {
        let env = test_env(Some(100));
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, 101)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(header(&response, "tus-max-size"), Some("100"));
    }

    #[tokio::test]
    async fn test_deferred_length_flow() {
        let env = test_env(None);
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_DEFER_LENGTH, "1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = header(&response, "location").unwrap().to_string();

        let head = send(&env, request("HEAD", &location).body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(header(&head, "upload-defer-length"), Some("1"));
        assert_eq!(header(&head, "upload-length"), None);

        let req = request("PATCH", &location)
            .header(protocol::UPLOAD_OFFSET, 0)
            .header(protocol::UPLOAD_LENGTH, 3)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(b"abc")))
            .unwrap();
        let response = send(&env, req).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(env.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_creation_with_upload() {
        let env = test_env(None);
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, 10)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(b"0123")))
            .unwrap();
        let response = send(&env, req).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(header(&response, "upload-offset"), Some("4"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;

        for _ in 0..2 {
            let response = send(&env, request("DELETE", &location).body(Full::new(Bytes::new())).unwrap()).await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let head = send(&env, request("HEAD", &location).body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(head.status(), StatusCode::NOT_FOUND);
        assert!(head.body().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_upload_is_not_found() {
        let env = test_env(None);
        let response = patch(&env, "/files/0123456789abcdef", 0, b"x").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_method_override() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;

        let req = request("POST", &location)
            .header(protocol::METHOD_OVERRIDE, "PATCH")
            .header(protocol::UPLOAD_OFFSET, 0)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(b"abc")))
            .unwrap();
        let response = send(&env, req).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "upload-offset"), Some("3"));
    }

    #[tokio::test]
    async fn test_health_and_unknown_paths() {
        let env = test_env(None);
        let response = send(&env, Request::get("/health").body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");

        let response = send(&env, Request::get("/nowhere").body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&env, request("GET", "/files/abc").body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_method_override_limited_to_tus_methods() {
        let env = test_env(None);
        let req = Request::get("/health")
            .header(protocol::METHOD_OVERRIDE, "M1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let req = request("POST", "/files")
            .header(protocol::METHOD_OVERRIDE, "GET")
            .header(protocol::UPLOAD_LENGTH, 5)
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::CREATED);
    }

    fn finalize_request(body: &str) -> Request<Full<Bytes>> {
        Request::post(FINALIZE_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[tokio::test]
    async fn test_finalize_reruns_hook() {
        let env = test_env(None);
        let location = create(&env, 3, Some("name YS50eHQ=")).await;
        patch(&env, &location, 0, b"abc").await;
        assert_eq!(env.completions.load(Ordering::SeqCst), 1);

        let id = location.rsplit('/').next().unwrap();
        let body = format!(r#"{{"upload_id":"{}","filename":"b.txt"}}"#, id);
        let response = send(&env, finalize_request(&body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-type"), Some("application/json"));
        let json: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(json["status"], "finalized");
        assert_eq!(json["offset"], 3);
        assert_eq!(env.completions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finalize_rejects_bad_requests() {
        let env = test_env(None);
        let location = create(&env, 10, None).await;
        let id = location.rsplit('/').next().unwrap();

        let incomplete = format!(r#"{{"upload_id":"{}"}}"#, id);
        assert_eq!(
            send(&env, finalize_request(&incomplete)).await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            send(&env, finalize_request("{not json")).await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            send(&env, finalize_request(r#"{"upload_id":"../etc"}"#)).await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            send(&env, finalize_request(r#"{"upload_id":"missing"}"#)).await.status(),
            StatusCode::NOT_FOUND
        );

        let req = Request::get(FINALIZE_PATH).body(Full::new(Bytes::new())).unwrap();
        assert_eq!(send(&env, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(env.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_length_hook_failure_still_reports_location() {
        let env = failing_env();
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, 0)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send(&env, req).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header(&response, "upload-offset"), Some("0"));
        let location = header(&response, "location").unwrap().to_string();
        assert!(location.starts_with("/files/"));

        let head = send(&env, request("HEAD", &location).body(Full::new(Bytes::new())).unwrap()).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(header(&head, "upload-offset"), Some("0"));
    }

    #[tokio::test]
    async fn test_creation_with_upload_hook_failure_reports_location() {
        let env = failing_env();
        let req = request("POST", "/files")
            .header(protocol::UPLOAD_LENGTH, 4)
            .header(CONTENT_TYPE, protocol::OFFSET_OCTET_STREAM)
            .body(Full::new(Bytes::from_static(b"full")))
            .unwrap();
        let response = send(&env, req).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(header(&response, "location").is_some());
    }
}
