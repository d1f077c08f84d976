//! Per-request state and the response pipeline.
//!
//! # Responsibilities
//! - Capture method, scheme, host, path, query, headers and body on entry
//! - Collect status, headers and one [`Content`] on exit
//! - Run the handler chain, recover handler panics, finalize the response
//! - Emit exactly one access log record per request
//!
//! # Design Decisions
//! - The access record is written from a drop guard, so it is emitted on
//!   normal completion, on unwinding and when the connection goes away
//! - Request bodies are buffered at most once and capped at
//!   `multipart_max_memory`

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Query, RawPathParams};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{FutureExt, TryStreamExt};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::config::{ModuleSettings, ServerConfig};
use crate::http::content::{BoxReader, Content};
use crate::http::handler::{Flow, HandlerChain};
use crate::http::server::ServerRuntime;
use crate::http::variable::Variable;
use crate::observability::LogSink;
use crate::proxy::{ProxyOptions, ProxyOverrides};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// Error type for reading and binding request input.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(#[source] axum::BoxError),

    #[error("request body was taken as a stream")]
    Consumed,

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid query string: {0}")]
    Query(#[from] axum::extract::rejection::QueryRejection),
}

/// A handler panic recovered at the pipeline boundary.
#[derive(Debug, Error)]
#[error("handler panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

enum BodyState {
    Pending(Body),
    Buffered(Bytes),
    Taken,
}

/// One inbound call.
///
/// Handlers read the request side through accessors and build the response
/// with the `send_*` / `exit*` / `proxy_pass` methods, all of which return
/// [`Flow::Stop`].
pub struct Request {
    runtime: Arc<ServerRuntime>,

    method: Method,
    version: Version,
    scheme: &'static str,
    host: String,
    uri: Uri,
    args: BTreeMap<String, String>,
    headers_in: HeaderMap,
    params: Vec<(String, String)>,
    remote_addr: Option<SocketAddr>,
    body: BodyState,

    status: Option<StatusCode>,
    headers_out: HeaderMap,
    content: Option<Content>,

    var: Variable,
    module_ctx: HashMap<String, Box<dyn Any + Send>>,
}

impl Request {
    pub(crate) fn new(
        parts: Parts,
        body: Body,
        params: Vec<(String, String)>,
        runtime: Arc<ServerRuntime>,
    ) -> Self {
        let config = runtime.config();
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string();
        let request_uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let var = Variable::new(config.listen_address(), config.index_dir(), request_uri);

        let mut headers_out = HeaderMap::new();
        headers_out.insert(axum::http::header::SERVER, runtime.server_header().clone());

        Self {
            scheme: if runtime.is_tls() { "https" } else { "http" },
            args: parse_args(parts.uri.query()),
            method: parts.method,
            version: parts.version,
            host,
            uri: parts.uri,
            headers_in: parts.headers,
            params,
            remote_addr,
            body: BodyState::Pending(body),
            status: None,
            headers_out,
            content: None,
            var,
            module_ctx: HashMap::new(),
            runtime,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// `http` or `https`, from the serving listener.
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    /// `Host` header, including any port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path and query as received.
    pub fn request_uri(&self) -> &str {
        &self.var.request_uri
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Decoded query arguments. Repeated keys keep their first value.
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn headers_in(&self) -> &HeaderMap {
        &self.headers_in
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers_in.get(name).and_then(|v| v.to_str().ok())
    }

    /// Route parameter captured by `{key}` or `{*key}`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Value of `x-request-id`, set by the request-id layer.
    pub fn request_id(&self) -> Option<&str> {
        self.header("x-request-id")
    }

    /// Status set so far. `None` finalizes as 200.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn headers_out(&self) -> &HeaderMap {
        &self.headers_out
    }

    pub fn headers_out_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers_out
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers_out.insert(name, value);
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn var(&self) -> &Variable {
        &self.var
    }

    pub fn var_mut(&mut self) -> &mut Variable {
        &mut self.var
    }

    /// Module settings of the serving server.
    pub fn config(&self) -> &ModuleSettings {
        self.runtime.config().settings()
    }

    pub fn server_config(&self) -> &ServerConfig {
        self.runtime.config()
    }

    /// Error sink of the serving server.
    pub fn logger(&self) -> &LogSink {
        self.runtime.error_log()
    }

    pub(crate) fn runtime(&self) -> &Arc<ServerRuntime> {
        &self.runtime
    }

    pub fn set_module_ctx<T: Any + Send>(&mut self, module: impl Into<String>, ctx: T) {
        self.module_ctx.insert(module.into(), Box::new(ctx));
    }

    pub fn module_ctx<T: Any + Send>(&self, module: &str) -> Option<&T> {
        self.module_ctx.get(module)?.downcast_ref()
    }

    pub fn module_ctx_mut<T: Any + Send>(&mut self, module: &str) -> Option<&mut T> {
        self.module_ctx.get_mut(module)?.downcast_mut()
    }

    /// Scratch directory for spooling uploads.
    pub fn multipart_temp_dir(&self) -> PathBuf {
        self.runtime.config().multipart_temp_dir()
    }

    /// Buffer the request body, at most `multipart_max_memory` bytes.
    ///
    /// Later calls return the same bytes.
    pub async fn read_body(&mut self) -> Result<Bytes, BodyError> {
        let limit = usize::try_from(self.runtime.config().multipart_max_memory())
            .unwrap_or(usize::MAX);

        match std::mem::replace(&mut self.body, BodyState::Taken) {
            BodyState::Pending(body) => match Limited::new(body, limit).collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    self.body = BodyState::Buffered(bytes.clone());
                    Ok(bytes)
                }
                Err(err) if err.is::<LengthLimitError>() => Err(BodyError::TooLarge { limit }),
                Err(err) => Err(BodyError::Read(err)),
            },
            BodyState::Buffered(bytes) => {
                self.body = BodyState::Buffered(bytes.clone());
                Ok(bytes)
            }
            BodyState::Taken => Err(BodyError::Consumed),
        }
    }

    /// Take the raw body stream, e.g. to spool a large upload to disk.
    pub fn take_body(&mut self) -> Option<Body> {
        match std::mem::replace(&mut self.body, BodyState::Taken) {
            BodyState::Pending(body) => Some(body),
            BodyState::Buffered(bytes) => Some(Body::from(bytes)),
            BodyState::Taken => None,
        }
    }

    /// Decode the body as JSON.
    pub async fn bind_body<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        let bytes = self.read_body().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decode the query string.
    pub fn bind_args<T: DeserializeOwned>(&self) -> Result<T, BodyError> {
        let Query(value) = Query::try_from_uri(&self.uri)?;
        Ok(value)
    }

    /// Continue with the next handler.
    pub fn next(&self) -> Flow {
        Flow::Continue
    }

    pub fn send_string(&mut self, message: impl Into<String>) -> Flow {
        self.content = Some(Content::Message(message.into()));
        Flow::Stop
    }

    pub fn send_structured<T: Serialize + ?Sized>(&mut self, value: &T) -> Flow {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.content = Some(Content::Structured(value));
                Flow::Stop
            }
            Err(err) => {
                self.logger()
                    .in_scope(|| tracing::error!(error = %err, "Failed to encode response"));
                self.exit_with(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    pub fn send_file(&mut self, path: impl Into<PathBuf>) -> Flow {
        self.content = Some(Content::File(path.into()));
        Flow::Stop
    }

    /// Stream `reader`. With a length, exactly that many bytes are sent.
    pub fn send_stream<R>(&mut self, reader: R, length: Option<u64>, content_type: &str) -> Flow
    where
        R: AsyncRead + Send + 'static,
    {
        self.content = Some(Content::Stream {
            reader: Box::pin(reader),
            length,
            content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
        });
        Flow::Stop
    }

    /// Copy `reader` as-is. Without a length it is copied to EOF.
    pub fn send_buffer<R>(&mut self, reader: R, length: Option<u64>) -> Flow
    where
        R: AsyncRead + Send + 'static,
    {
        self.content = Some(Content::Buffer {
            reader: Box::pin(reader),
            length,
        });
        Flow::Stop
    }

    pub fn exit(&mut self, status: StatusCode) -> Flow {
        self.status = Some(status);
        Flow::Stop
    }

    pub fn exit_with(&mut self, status: StatusCode, message: impl Into<String>) -> Flow {
        self.status = Some(status);
        self.send_string(message)
    }

    /// Pass the request through to `address` and answer with its response.
    ///
    /// Method, scheme, path, query, headers and body default to the inbound
    /// request. A failed call leaves status 502 and logs the error; it is never
    /// returned to the caller.
    ///
    /// If an earlier handler took the body with [`take_body`](Self::take_body),
    /// the upstream receives an empty body and a warning is logged.
    pub async fn proxy_pass(&mut self, address: &str, overrides: ProxyOverrides) -> Flow {
        let body = if overrides.has_body() {
            Bytes::new()
        } else {
            match self.read_body().await {
                Ok(body) => body,
                Err(BodyError::Consumed) => {
                    self.logger().in_scope(|| {
                        tracing::warn!(
                            uri = %self.request_uri(),
                            "Request body already taken, proxying an empty body"
                        )
                    });
                    Bytes::new()
                }
                Err(BodyError::TooLarge { .. }) => return self.exit(StatusCode::PAYLOAD_TOO_LARGE),
                Err(err) => {
                    self.logger()
                        .in_scope(|| tracing::warn!(error = %err, "Proxy pass aborted"));
                    return self.exit(StatusCode::BAD_REQUEST);
                }
            }
        };

        let config = self.runtime.config();
        let mut options = ProxyOptions {
            scheme: self.scheme.to_string(),
            address: address.to_string(),
            method: self.method.clone(),
            uri: self.path().to_string(),
            args: self.args.clone(),
            headers: self.headers_in.clone(),
            body,
            connect_timeout: config.proxy_connect_timeout(),
            read_timeout: config.proxy_read_timeout(),
        };
        overrides.apply(&mut options);

        let response = match self.runtime.proxy().send(options).await {
            Ok(response) => response,
            Err(err) => {
                self.status = Some(StatusCode::BAD_GATEWAY);
                self.logger()
                    .in_scope(|| tracing::error!(error = %err, "Proxy pass failed"));
                return Flow::Stop;
            }
        };

        self.status = Some(response.status());
        let length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        for name in response.headers().keys() {
            self.headers_out.remove(name);
        }
        for (name, value) in response.headers() {
            self.headers_out.append(name.clone(), value.clone());
        }

        let stream = response.bytes_stream().map_err(io::Error::other);
        self.content = Some(Content::Stream {
            reader: Box::pin(StreamReader::new(stream)),
            length,
            content_type,
        });
        Flow::Stop
    }

    /// Turn the collected status, headers and content into a response.
    pub(crate) async fn finalize(mut self) -> Response {
        let status = self.status.unwrap_or(StatusCode::OK);
        let mut headers = std::mem::take(&mut self.headers_out);

        let mut response = match self.content.take() {
            None => Response::new(Body::empty()),
            Some(Content::Message(message)) => {
                with_type(Response::new(Body::from(message)), TEXT_PLAIN)
            }
            Some(Content::Structured(value)) => match serde_json::to_vec(&value) {
                Ok(bytes) => with_type(Response::new(Body::from(bytes)), APPLICATION_JSON),
                Err(err) => {
                    self.logger()
                        .in_scope(|| tracing::error!(error = %err, "Failed to encode response"));
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    response.headers_mut().extend(headers);
                    return response;
                }
            },
            Some(Content::File(path)) => {
                let mut response =
                    serve_file(self.method.clone(), self.headers_in.clone(), path).await;
                if response.status() == StatusCode::OK {
                    *response.status_mut() = status;
                }
                response.headers_mut().extend(headers);
                return response;
            }
            Some(Content::Stream {
                reader,
                length,
                content_type,
            }) => {
                let mut response = stream_response(reader, length, &mut headers);
                if let Some(ct) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                    response.headers_mut().insert(CONTENT_TYPE, ct);
                }
                response
            }
            Some(Content::Buffer { reader, length }) => {
                stream_response(reader, length, &mut headers)
            }
        };

        *response.status_mut() = status;
        response.headers_mut().extend(headers);
        response
    }
}

/// Serve `path` through `ServeFile`, honoring conditional and range headers.
async fn serve_file(method: Method, headers: HeaderMap, path: PathBuf) -> Response {
    let mut file_request = axum::http::Request::new(Body::empty());
    *file_request.method_mut() = if method == Method::HEAD {
        Method::HEAD
    } else {
        Method::GET
    };
    *file_request.headers_mut() = headers;

    match ServeFile::new(path).oneshot(file_request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

fn with_type(mut response: Response, content_type: &'static str) -> Response {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn stream_response(reader: BoxReader, length: Option<u64>, headers: &mut HeaderMap) -> Response {
    match length {
        Some(length) => {
            headers.remove(TRANSFER_ENCODING);
            headers.remove(CONTENT_LENGTH);
            let body = Body::from_stream(ReaderStream::new(reader.take(length)));
            let mut response = Response::new(body);
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => Response::new(Body::from_stream(ReaderStream::new(reader))),
    }
}

fn parse_args(query: Option<&str>) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            args.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    args
}

/// One access log line, written when dropped.
struct AccessRecord {
    runtime: Arc<ServerRuntime>,
    remote: String,
    method: Method,
    uri: String,
    version: Version,
    user_agent: String,
    started: Instant,
    status: Option<u16>,
    attach: String,
}

impl AccessRecord {
    fn begin(req: &Request) -> Self {
        Self {
            runtime: Arc::clone(&req.runtime),
            remote: req
                .remote_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "-".to_string()),
            method: req.method.clone(),
            uri: req.request_uri().to_string(),
            version: req.version,
            user_agent: req.header(USER_AGENT.as_str()).unwrap_or("-").to_string(),
            started: req.var.start_time,
            status: None,
            attach: "-".to_string(),
        }
    }

    fn complete(&mut self, status: StatusCode, attach: String) {
        self.status = Some(status.as_u16());
        self.attach = attach;
    }
}

impl Drop for AccessRecord {
    fn drop(&mut self) {
        // 499: the client went away before the response was built.
        let status = self.status.unwrap_or(if std::thread::panicking() {
            500
        } else {
            499
        });
        let line = format!(
            "{} {} {} {:?} {} {:.3} {} {}",
            self.remote,
            self.method,
            self.uri,
            self.version,
            status,
            self.started.elapsed().as_millis() as f64 / 1000.0,
            self.user_agent,
            self.attach,
        );
        self.runtime
            .access_log()
            .in_scope(|| tracing::info!(target: "access", "{line}"));
    }
}

/// Run `chain` for one inbound call and finalize the response.
pub(crate) async fn dispatch(
    runtime: Arc<ServerRuntime>,
    chain: HandlerChain,
    req: axum::extract::Request,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let params = match RawPathParams::from_request_parts(&mut parts, &()).await {
        Ok(params) => params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Err(_) => Vec::new(),
    };

    let _in_flight = runtime.tracker().track();
    let mut request = Request::new(parts, body, params, Arc::clone(&runtime));
    let mut access = AccessRecord::begin(&request);

    let outcome = AssertUnwindSafe(chain.run(&mut request))
        .catch_unwind()
        .await;
    if let Err(payload) = outcome {
        let panic = HandlerPanic::from_payload(payload.as_ref());
        runtime.error_log().in_scope(|| {
            tracing::error!(error = %panic, uri = %request.request_uri(), "Recovered handler panic")
        });
        request.exit_with(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }

    let attach = request.var.log_attach.clone();
    let response = request.finalize().await;
    access.complete(response.status(), attach);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<F: std::future::Future + Send>(_: F) {}

    // Type-checked only: the pipeline futures are boxed as `Send`.
    #[allow(dead_code)]
    fn pipeline_futures_are_send(
        runtime: Arc<ServerRuntime>,
        chain: HandlerChain,
        inbound: axum::extract::Request,
        request: Request,
    ) {
        require_send(dispatch(runtime, chain, inbound));
        require_send(request.finalize());
        require_send(serve_file(Method::GET, HeaderMap::new(), PathBuf::from("/")));
    }

    #[test]
    fn query_keeps_first_value() {
        let args = parse_args(Some("a=1&b=x%20y&a=2"));
        assert_eq!(args.get("a").map(String::as_str), Some("1"));
        assert_eq!(args.get("b").map(String::as_str), Some("x y"));
        assert!(parse_args(None).is_empty());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(HandlerPanic::from_payload(boxed.as_ref()).message, "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(HandlerPanic::from_payload(boxed.as_ref()).message, "bang");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(
            HandlerPanic::from_payload(boxed.as_ref()).message,
            "non-string panic payload"
        );
    }
}
