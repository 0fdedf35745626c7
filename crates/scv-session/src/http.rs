//! Minimal HTTP/1.1 transport over `SessionService`.
//!
//! One request per connection. Sockets are driven by tokio; every handler
//! runs on the blocking pool because the stores do synchronous I/O.

use crate::{SessionError, SessionService, StopRequest};
use md5::{Digest, Md5};
use scv_store::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Error)]
pub enum HttpServeError {
    #[error("bind failed: {0}")]
    Bind(io::Error),
    #[error("accept failed: {0}")]
    Accept(io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    method: String,
    target: String,
    authorization: Option<String>,
    /// Hex MD5 of the body, when the client sent one.
    content_md5: Option<String>,
    body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Json(Value),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
struct HttpResponse {
    status: u16,
    body: Body,
}

impl HttpResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Body::Json(json!({ "error": message.into() })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Healthz,
    CreateStream,
    StreamInfo(String),
    Download { stream_id: String, path: String },
    Activate,
    Start,
    Frame,
    Checkpoint,
    Stop,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
enum RouteError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Bind `config.bind` and serve until the process exits.
pub async fn serve(
    service: Arc<SessionService>,
    config: HttpServerConfig,
) -> Result<(), HttpServeError> {
    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(HttpServeError::Bind)?;
    info!(bind = %config.bind, "listening");
    serve_until(listener, service, std::future::pending()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_until(
    listener: TcpListener,
    service: Arc<SessionService>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), HttpServeError> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                let (mut socket, peer) = accepted.map_err(HttpServeError::Accept)?;
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(&mut socket, service).await {
                        debug!(%peer, error = %err, "connection dropped");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_connection<S>(socket: &mut S, service: Arc<SessionService>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_request(socket).await {
        Ok(request) => {
            match tokio::task::spawn_blocking(move || respond(&service, request)).await {
                Ok(response) => response,
                Err(err) => HttpResponse::error(500, format!("handler failed: {err}")),
            }
        }
        Err(err) => route_error_response(err),
    };
    write_response(socket, response).await
}

async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request, RouteError> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(RouteError::BadRequest("request head too large".to_string()));
        }
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| RouteError::BadRequest(format!("failed to read request: {e}")))?;
        if n == 0 {
            let message = if buf.is_empty() {
                "empty request"
            } else {
                "truncated request head"
            };
            return Err(RouteError::BadRequest(message.to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| RouteError::BadRequest("request head is not UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");
    let (method, target) = parse_request_line(lines.next().unwrap_or_default())?;
    let mut content_length = 0usize;
    let mut authorization = None;
    let mut content_md5 = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| RouteError::BadRequest(format!("bad content-length: {value}")))?;
        } else if name.eq_ignore_ascii_case("authorization") && !value.is_empty() {
            authorization = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-md5") && !value.is_empty() {
            content_md5 = Some(value.to_string());
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(RouteError::BadRequest("request body too large".to_string()));
    }

    // grow with the bytes that arrive, not with the declared length
    let mut body = buf.split_off(head_end + 4);
    if body.len() < content_length {
        let remaining = (content_length - body.len()) as u64;
        (&mut *reader)
            .take(remaining)
            .read_to_end(&mut body)
            .await
            .map_err(|e| RouteError::BadRequest(format!("failed to read body: {e}")))?;
        if body.len() < content_length {
            return Err(RouteError::BadRequest(format!(
                "truncated body: {} of {content_length} bytes",
                body.len()
            )));
        }
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        target,
        authorization,
        content_md5,
        body,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_request_line(line: &str) -> Result<(String, String), RouteError> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RouteError::BadRequest("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| RouteError::BadRequest("missing target".to_string()))?;
    Ok((method.to_string(), target.to_string()))
}

fn parse_route(method: &str, target: &str) -> Result<Route, RouteError> {
    let path = percent_decode(split_target(target));
    let (route, allowed) = match path.as_str() {
        "/healthz" => (Route::Healthz, "GET"),
        "/streams" => (Route::CreateStream, "POST"),
        "/streams/activate" => (Route::Activate, "POST"),
        "/core/start" => (Route::Start, "GET"),
        "/core/frame" => (Route::Frame, "POST"),
        "/core/checkpoint" => (Route::Checkpoint, "POST"),
        "/core/stop" => (Route::Stop, "PUT"),
        other => {
            if let Some(stream_id) = other.strip_prefix("/streams/info/") {
                if stream_id.is_empty() || stream_id.contains('/') {
                    return Err(RouteError::BadRequest(
                        "expected /streams/info/<stream_id>".to_string(),
                    ));
                }
                (Route::StreamInfo(stream_id.to_string()), "GET")
            } else if let Some(rest) = other.strip_prefix("/streams/download/") {
                let (stream_id, file) = rest
                    .split_once('/')
                    .filter(|(id, file)| !id.is_empty() && !file.is_empty())
                    .ok_or_else(|| {
                        RouteError::BadRequest(
                            "expected /streams/download/<stream_id>/<path>".to_string(),
                        )
                    })?;
                (
                    Route::Download {
                        stream_id: stream_id.to_string(),
                        path: file.to_string(),
                    },
                    "GET",
                )
            } else {
                return Err(RouteError::NotFound(format!("unknown route: {other}")));
            }
        }
    };
    if method != allowed {
        return Err(RouteError::MethodNotAllowed(format!(
            "{method} {path}; use {allowed}"
        )));
    }
    Ok(route)
}

fn split_target(target: &str) -> &str {
    match target.split_once('?') {
        Some((path, _query)) => path,
        None => target,
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let (Some(h), Some(l)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    out.push(h * 16 + l);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

fn respond(service: &SessionService, request: Request) -> HttpResponse {
    let route = match parse_route(&request.method, &request.target) {
        Ok(route) => route,
        Err(err) => return route_error_response(err),
    };
    if matches!(route, Route::Frame | Route::Checkpoint)
        && let Some(expected) = request.content_md5.as_deref()
        && let Err(err) = verify_content_md5(expected, &request.body)
    {
        return handler_error_response(err.into());
    }
    let credential = request.authorization.as_deref();
    match execute_route(service, route, credential, &request.body) {
        Ok(body) => HttpResponse { status: 200, body },
        Err(err) => handler_error_response(err),
    }
}

/// Checked before the lease is looked up, so a corrupted upload never
/// touches the session.
fn verify_content_md5(expected: &str, body: &[u8]) -> Result<(), SessionError> {
    let actual = format!("{:x}", Md5::digest(body));
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(SessionError::InvalidPayload(format!(
            "Content-MD5 mismatch: header {expected}, body {actual}"
        )))
    }
}

fn execute_route(
    service: &SessionService,
    route: Route,
    credential: Option<&str>,
    body: &[u8],
) -> Result<Body, HandlerError> {
    // lease endpoints carry the lease token as their credential
    let token = credential.unwrap_or_default();
    match route {
        Route::Healthz => Ok(Body::Json(json!({ "ok": true }))),
        Route::CreateStream => json_body(&service.create_stream(credential, parse_body(body)?)?),
        Route::StreamInfo(stream_id) => json_body(&service.stream_info(&stream_id)?),
        Route::Download { stream_id, path } => {
            Ok(Body::Bytes(service.download(credential, &stream_id, &path)?))
        }
        Route::Activate => json_body(&service.activate(credential, parse_body(body)?)?),
        Route::Start => json_body(&service.start(token)?),
        Route::Frame => {
            service.post_frame(token, parse_body(body)?)?;
            Ok(Body::Json(json!({})))
        }
        Route::Checkpoint => json_body(&service.post_checkpoint(token, parse_body(body)?)?),
        Route::Stop => {
            let request = if body.is_empty() {
                StopRequest::default()
            } else {
                parse_body(body)?
            };
            service.stop(token, request)?;
            Ok(Body::Json(json!({})))
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(body).map_err(|e| HandlerError::BadRequest(format!("bad JSON: {e}")))
}

fn json_body<T: Serialize>(value: &T) -> Result<Body, HandlerError> {
    serde_json::to_value(value)
        .map(Body::Json)
        .map_err(|e| HandlerError::Internal(e.to_string()))
}

fn route_error_response(err: RouteError) -> HttpResponse {
    match err {
        RouteError::BadRequest(msg) => HttpResponse::error(400, msg),
        RouteError::NotFound(msg) => HttpResponse::error(404, msg),
        RouteError::MethodNotAllowed(msg) => HttpResponse::error(405, msg),
    }
}

fn handler_error_response(err: HandlerError) -> HttpResponse {
    let status = match &err {
        HandlerError::BadRequest(_) => 400,
        HandlerError::Internal(_) => 500,
        HandlerError::Session(SessionError::Unauthorized(_)) => 401,
        HandlerError::Session(SessionError::Store(StoreError::BlobNotFound(_))) => 404,
        HandlerError::Session(session) if session.is_client_error() => 400,
        HandlerError::Session(_) => 500,
    };
    if status == 500 {
        warn!(error = %err, "request failed");
    }
    HttpResponse::error(status, err.to_string())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: HttpResponse,
) -> io::Result<()> {
    let (content_type, body) = match response.body {
        Body::Json(value) => ("application/json", serde_json::to_vec(&value)?),
        Body::Bytes(bytes) => ("application/octet-stream", bytes),
    };
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        content_type,
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ActivateRequest, CreateStreamRequest, SessionConfig, StaticAuthenticator, UserCredential,
    };
    use scv_core::CoreError;
    use scv_store::{FsBlobStore, JsonlRecordStore};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::net::TcpStream;
    use tokio::runtime::Handle;

    fn temp_dir(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "scv-http-{prefix}-{}-{unique}",
            std::process::id()
        ));
        std::fs::create_dir_all(&root).expect("temp dir should be created");
        root
    }

    fn service(prefix: &str) -> Arc<SessionService> {
        let dir = temp_dir(prefix);
        let records = JsonlRecordStore::open(&dir).expect("record store");
        let auth = StaticAuthenticator::new([UserCredential {
            id: "manager".to_string(),
            token: "mgr-token".to_string(),
            manager: true,
        }]);
        Arc::new(SessionService::new(
            SessionConfig::new("hunter2"),
            Arc::new(records),
            Arc::new(FsBlobStore::new(dir.join("blobs"))),
            Arc::new(auth),
            Handle::current(),
        ))
    }

    #[test]
    fn route_parsing_covers_the_surface() {
        assert_eq!(parse_route("GET", "/healthz"), Ok(Route::Healthz));
        assert_eq!(parse_route("POST", "/streams"), Ok(Route::CreateStream));
        assert_eq!(parse_route("PUT", "/core/stop"), Ok(Route::Stop));
        assert_eq!(
            parse_route("GET", "/streams/info/abc?verbose=1"),
            Ok(Route::StreamInfo("abc".to_string()))
        );
        assert_eq!(
            parse_route("GET", "/streams/download/abc/3/1/checkpoint_files/state.xml"),
            Ok(Route::Download {
                stream_id: "abc".to_string(),
                path: "3/1/checkpoint_files/state.xml".to_string()
            })
        );
        assert_eq!(
            parse_route("GET", "/streams/download/abc/buffer_files/frames%2Extc"),
            Ok(Route::Download {
                stream_id: "abc".to_string(),
                path: "buffer_files/frames.xtc".to_string()
            })
        );
    }

    #[test]
    fn route_parsing_reports_bad_routes() {
        assert!(matches!(
            parse_route("GET", "/nope"),
            Err(RouteError::NotFound(_))
        ));
        assert!(matches!(
            parse_route("GET", "/core/stop"),
            Err(RouteError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            parse_route("GET", "/streams/download/abc"),
            Err(RouteError::BadRequest(_))
        ));
    }

    #[test]
    fn percent_decode_keeps_invalid_escapes() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn session_errors_map_to_status_codes() {
        let status = |err: SessionError| handler_error_response(err.into()).status;
        assert_eq!(status(SessionError::Core(CoreError::NoActiveLease)), 400);
        assert_eq!(status(SessionError::DuplicateFrame), 400);
        assert_eq!(status(SessionError::TargetNotFound("t".to_string())), 400);
        assert_eq!(status(SessionError::Unauthorized("no".to_string())), 401);
        assert_eq!(
            status(SessionError::Store(StoreError::BlobNotFound("x".to_string()))),
            404
        );
        assert_eq!(
            status(SessionError::Store(StoreError::Io {
                path: "x".to_string(),
                message: "disk full".to_string()
            })),
            500
        );
    }

    #[tokio::test]
    async fn reads_head_and_body_across_chunks() {
        let raw: &[u8] = b"PUT /core/stop HTTP/1.1\r\nAuthorization: tok\r\nContent-Length: 13\r\n\r\n{\"error\":\"x\"}";
        let mut reader = raw;
        let request = read_request(&mut reader).await.expect("request");
        assert_eq!(request.method, "PUT");
        assert_eq!(request.target, "/core/stop");
        assert_eq!(request.authorization.as_deref(), Some("tok"));
        assert_eq!(request.body, b"{\"error\":\"x\"}");

        let mut empty: &[u8] = b"";
        assert!(matches!(
            read_request(&mut empty).await,
            Err(RouteError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn short_bodies_are_rejected_without_waiting_for_the_declared_length() {
        let raw: &[u8] = b"POST /core/frame HTTP/1.1\r\nContent-MD5: abc\r\nContent-Length: 100000000\r\n\r\n{}";
        let mut reader = raw;
        let err = read_request(&mut reader).await.expect_err("truncated");
        assert!(
            matches!(&err, RouteError::BadRequest(msg) if msg.contains("2 of 100000000")),
            "{err:?}"
        );

        let raw: &[u8] = b"POST /core/frame HTTP/1.1\r\ncontent-md5: abc\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader = raw;
        let request = read_request(&mut reader).await.expect("request");
        assert_eq!(request.content_md5.as_deref(), Some("abc"));
    }

    #[test]
    fn content_md5_is_hex_and_case_insensitive() {
        verify_content_md5("d41d8cd98f00b204e9800998ecf8427e", b"").expect("empty body");
        verify_content_md5("D41D8CD98F00B204E9800998ECF8427E", b"").expect("upper case");
        assert!(matches!(
            verify_content_md5("1234", b"{}"),
            Err(SessionError::InvalidPayload(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn content_md5_mismatch_leaves_the_lease_untouched() {
        let service = service("md5");
        let token = tokio::task::spawn_blocking({
            let service = service.clone();
            move || {
                service
                    .create_stream(
                        Some("mgr-token"),
                        CreateStreamRequest {
                            target_id: "t-1".to_string(),
                            files: Default::default(),
                            tags: Default::default(),
                        },
                    )
                    .expect("create");
                service
                    .activate(
                        Some("hunter2"),
                        ActivateRequest {
                            target_id: "t-1".to_string(),
                            engine: "openmm".to_string(),
                            user: "donor".to_string(),
                        },
                    )
                    .expect("activate")
                    .token
            }
        })
        .await
        .expect("join");

        let body = br#"{"files":{"frames.xtc":"A"}}"#.to_vec();
        let post = |content_md5: &str| Request {
            method: "POST".to_string(),
            target: "/core/frame".to_string(),
            authorization: Some(token.clone()),
            content_md5: Some(content_md5.to_string()),
            body: body.clone(),
        };
        let digest = format!("{:x}", Md5::digest(&body));
        let (rejected, accepted, stream_id) = tokio::task::spawn_blocking({
            let service = service.clone();
            let (bad, good) = (post("1234"), post(&digest));
            let token = token.clone();
            move || {
                let rejected = respond(&service, bad);
                let stream_id = service.start(&token).expect("lease survives").stream_id;
                let buffered = service
                    .download(Some("mgr-token"), &stream_id, "buffer_files/frames.xtc")
                    .expect("buffer");
                assert!(buffered.is_empty());
                (rejected, respond(&service, good), stream_id)
            }
        })
        .await
        .expect("join");
        assert_eq!(rejected.status, 400);
        assert_eq!(accepted.status, 200);

        let buffered = tokio::task::spawn_blocking(move || {
            service.download(Some("mgr-token"), &stream_id, "buffer_files/frames.xtc")
        })
        .await
        .expect("join")
        .expect("buffer");
        assert_eq!(buffered, b"A");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lease_endpoints_reject_unknown_tokens() {
        let service = service("tokens");
        let request = Request {
            method: "GET".to_string(),
            target: "/core/start".to_string(),
            authorization: Some("bogus".to_string()),
            content_md5: None,
            body: Vec::new(),
        };
        let response = tokio::task::spawn_blocking(move || respond(&service, request))
            .await
            .expect("join");
        assert_eq!(response.status, 400);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_requests_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, service("tcp"), async move {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write");
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.expect("read");
        let text = String::from_utf8(raw).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.ends_with("{\"ok\":true}"), "{text}");

        let _ = stop_tx.send(());
        server.await.expect("join").expect("serve");
    }
}
