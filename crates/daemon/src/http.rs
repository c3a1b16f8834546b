//! HTTP/1.1 over Unix domain sockets.
//!
//! Both the master daemon and the workers speak plain HTTP with JSON bodies on
//! a Unix socket. Bodies are small and always buffered in full.

use std::convert::Infallible;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;

/// Response body type used throughout the daemon.
pub type Body = Full<Bytes>;

/// Path of the worker liveness probe.
pub const HEARTBEAT_PATH: &str = "/heartbeat/";

/// Serves HTTP/1.1 on one accepted connection until the peer hangs up.
///
/// Errors caused by the client going away mid-exchange are logged at debug
/// level only.
pub async fn serve_connection<F, Fut>(stream: UnixStream, handler: F)
where
	F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Response<Body>> + Send + 'static,
{
	let service = service_fn(move |req| {
		let fut = handler(req);
		async move { Ok::<_, Infallible>(fut.await) }
	});
	let result = hyper::server::conn::http1::Builder::new()
		.serve_connection(TokioIo::new(stream), service)
		.await;

	if let Err(e) = result {
		if is_disconnect(&e) {
			tracing::debug!(error = %e, "client disconnected");
		} else {
			tracing::warn!(error = %e, "connection error");
		}
	}
}

fn is_disconnect(error: &hyper::Error) -> bool {
	if error.is_incomplete_message() || error.is_canceled() || error.is_closed() {
		return true;
	}
	let mut source = std::error::Error::source(error);
	while let Some(inner) = source {
		if let Some(io) = inner.downcast_ref::<std::io::Error>() {
			return matches!(
				io.kind(),
				std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof
			);
		}
		source = std::error::Error::source(inner);
	}
	false
}

/// Builds a response with a JSON body.
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
	let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
	*response.status_mut() = status;
	response
		.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	response
}

/// Builds a `{"error": message}` response.
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
	json_response(status, &serde_json::json!({ "error": message }))
}

/// A fully buffered response from a worker.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
	/// Status sent by the worker.
	pub status: StatusCode,
	/// `Content-Type` sent by the worker, if any.
	pub content_type: Option<HeaderValue>,
	/// The complete body.
	pub body: Bytes,
}

/// Failure of a client exchange.
#[derive(Debug, Error)]
pub enum ClientError {
	/// No connection within the connect timeout.
	#[error("connect timed out")]
	ConnectTimeout,
	/// The socket refused the connection.
	#[error("connect failed: {0}")]
	Connect(std::io::Error),
	/// The exchange did not complete within the total timeout.
	#[error("request timed out")]
	Timeout,
	/// HTTP-level failure after connecting.
	#[error(transparent)]
	Http(hyper::Error),
}

/// An outgoing request to a Unix socket.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
	/// HTTP method.
	pub method: Method,
	/// Path and query.
	pub path: String,
	/// `Content-Type` to send, if any.
	pub content_type: Option<HeaderValue>,
	/// Request body.
	pub body: Bytes,
}

impl OutboundRequest {
	/// A bodyless `GET`.
	pub fn get(path: impl Into<String>) -> Self {
		Self {
			method: Method::GET,
			path: path.into(),
			content_type: None,
			body: Bytes::new(),
		}
	}
}

/// Sends one request over a fresh connection to `socket` and buffers the reply.
///
/// `connect_timeout` bounds connecting; `total_timeout` bounds the exchange
/// after the connection is established.
///
/// # Errors
///
/// Returns a [`ClientError`] describing which stage failed.
pub async fn send(
	socket: &Path,
	request: OutboundRequest,
	connect_timeout: Duration,
	total_timeout: Duration,
) -> Result<BufferedResponse, ClientError> {
	let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(socket))
		.await
		.map_err(|_| ClientError::ConnectTimeout)?
		.map_err(ClientError::Connect)?;

	tokio::time::timeout(total_timeout, exchange(stream, request))
		.await
		.map_err(|_| ClientError::Timeout)?
		.map_err(ClientError::Http)
}

async fn exchange(stream: UnixStream, request: OutboundRequest) -> Result<BufferedResponse, hyper::Error> {
	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
	let driver = tokio::spawn(async move {
		if let Err(e) = conn.await {
			tracing::debug!(error = %e, "worker connection closed with error");
		}
	});

	let mut outbound = Request::new(Full::new(request.body));
	*outbound.method_mut() = request.method;
	*outbound.uri_mut() = match request.path.parse() {
		Ok(uri) => uri,
		Err(_) => http::Uri::from_static("/"),
	};
	outbound.headers_mut().insert(HOST, HeaderValue::from_static("localhost"));
	if let Some(content_type) = request.content_type {
		outbound.headers_mut().insert(CONTENT_TYPE, content_type);
	}

	let result = async {
		let response = sender.send_request(outbound).await?;
		let status = response.status();
		let content_type = response.headers().get(CONTENT_TYPE).cloned();
		let body = response.into_body().collect().await?.to_bytes();
		Ok(BufferedResponse {
			status,
			content_type,
			body,
		})
	}
	.await;

	driver.abort();
	result
}

/// Returns true if anything answering HTTP listens on `socket`.
///
/// Any status counts, so a server without a heartbeat route is still live.
pub async fn probe(socket: &Path, timeout: Duration) -> bool {
	send(socket, OutboundRequest::get(HEARTBEAT_PATH), timeout, timeout)
		.await
		.is_ok()
}
