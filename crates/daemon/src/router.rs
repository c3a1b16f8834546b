//! Request routing: pick the worker for a request's fork and relay to it.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eels_forks::Resolver;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Map, Value, json};

use crate::config::DaemonSettings;
use crate::error::DaemonError;
use crate::http::{self as wire, Body, ClientError, OutboundRequest, error_response};
use crate::supervisor::Supervisor;


const METADATA_KEY: &str = "_info_metadata";

/// Fields the router reads from a request body.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
	/// Value of `state.fork`.
	pub fork: String,
	/// Total relay timeout, from the `timeout` field in seconds.
	pub timeout: Duration,
}

impl ForwardRequest {
	/// Extracts routing fields from a JSON request body.
	///
	/// # Errors
	///
	/// Returns [`DaemonError::BadRequest`] unless the body is a JSON object with
	/// a string `state.fork` and, if present, a non-negative numeric `timeout`.
	pub fn parse(body: &[u8], default_timeout: Duration) -> Result<Self, DaemonError> {
		let value: Value =
			serde_json::from_slice(body).map_err(|e| DaemonError::BadRequest(format!("body is not valid JSON: {e}")))?;
		if !value.is_object() {
			return Err(DaemonError::BadRequest("body must be a JSON object".into()));
		}

		let fork = value
			.pointer("/state/fork")
			.and_then(Value::as_str)
			.ok_or_else(|| DaemonError::BadRequest("missing string field state.fork".into()))?;

		let timeout = match value.get("timeout") {
			None | Some(Value::Null) => default_timeout,
			Some(timeout) => timeout
				.as_f64()
				.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
				.ok_or_else(|| DaemonError::BadRequest("timeout must be a non-negative number of seconds".into()))?,
		};

		Ok(Self {
			fork: fork.to_string(),
			timeout,
		})
	}
}

/// Routes `POST` requests to per-fork workers.
#[derive(Debug)]
pub struct Router {
	resolver: Arc<Resolver>,
	supervisor: Arc<Supervisor>,
	connect_timeout: Duration,
	default_timeout: Duration,
	provenance: bool,
}

impl Router {
	/// Creates a router over `supervisor`'s workers.
	pub fn new(resolver: Arc<Resolver>, supervisor: Arc<Supervisor>, settings: &DaemonSettings) -> Self {
		Self {
			resolver,
			supervisor,
			connect_timeout: settings.connect_timeout,
			default_timeout: settings.default_request_timeout,
			provenance: settings.provenance,
		}
	}

	/// The supervisor owning the workers.
	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	/// Handles one inbound request. Failures become `{"error": ..}` responses.
	pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
	where
		B: hyper::body::Body,
		B::Error: Display,
	{
		if req.method() != Method::POST {
			tracing::trace!(method = %req.method(), path = %req.uri().path(), "unsupported method");
			return error_response(StatusCode::NOT_IMPLEMENTED, "only POST is supported");
		}

		let (parts, body) = req.into_parts();
		let body = match body.collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(e) => {
				tracing::debug!(error = %e, "failed to read request body");
				return error_response(StatusCode::BAD_REQUEST, &format!("failed to read body: {e}"));
			}
		};

		match self.route(&parts, body).await {
			Ok(response) => response,
			Err(e) => {
				let status = e.status();
				if status.is_server_error() {
					tracing::warn!(%status, error = %e, "request failed");
				} else {
					tracing::debug!(%status, error = %e, "request rejected");
				}
				error_response(status, &e.to_string())
			}
		}
	}

	async fn route(&self, parts: &http::request::Parts, body: Bytes) -> Result<Response<Body>, DaemonError> {
		let request = ForwardRequest::parse(&body, self.default_timeout)?;
		let fork = request.fork.as_str();
		self.resolver.check(fork)?;

		let lease = self.supervisor.ensure_worker(fork).await?;
		let outbound = OutboundRequest {
			method: parts.method.clone(),
			path: parts.uri.path_and_query().map_or("/", |p| p.as_str()).to_string(),
			content_type: parts.headers.get(CONTENT_TYPE).cloned(),
			body,
		};
		tracing::debug!(%fork, path = %outbound.path, timeout = ?request.timeout, "relaying request");

		let reply = wire::send(lease.socket(), outbound, self.connect_timeout, request.timeout)
			.await
			.map_err(|e| relay_error(fork, request.timeout, e))?;
		drop(lease);

		let mut body = reply.body;
		let mut content_type = reply.content_type;
		if self.provenance
			&& reply.status.is_success()
			&& let Some(annotated) = self.annotate(fork, &body)
		{
			body = annotated;
			content_type = Some(HeaderValue::from_static("application/json"));
		}

		let mut response = Response::new(Body::new(body));
		*response.status_mut() = reply.status;
		if let Some(content_type) = content_type {
			response.headers_mut().insert(CONTENT_TYPE, content_type);
		}
		Ok(response)
	}

	/// Adds `_info_metadata.eels-resolution` to a JSON object body.
	///
	/// The worker's bytes are kept as they are and the field is spliced in
	/// before the closing brace, so key order and number literals survive.
	/// Returns `None` for anything that is not a JSON object.
	fn annotate(&self, fork: &str, body: &[u8]) -> Option<Bytes> {
		let Ok(object) = serde_json::from_slice::<Map<String, Value>>(body) else {
			return None;
		};
		let info = match self.resolver.describe(fork) {
			Ok(info) => info,
			Err(e) => {
				tracing::warn!(%fork, error = %e, "failed to describe fork resolution");
				return None;
			}
		};
		let metadata = json!({ "eels-resolution": info });

		if object.contains_key(METADATA_KEY) {
			let mut object = object;
			object.insert(METADATA_KEY.into(), metadata);
			return Some(Bytes::from(Value::Object(object).to_string()));
		}

		let close = body.iter().rposition(|b| !b.is_ascii_whitespace())?;
		let mut out = Vec::with_capacity(body.len() + 256);
		out.extend_from_slice(&body[..close]);
		if !object.is_empty() {
			out.push(b',');
		}
		out.extend_from_slice(format!("\"{METADATA_KEY}\":{metadata}").as_bytes());
		out.extend_from_slice(&body[close..]);
		Some(Bytes::from(out))
	}
}

fn relay_error(fork: &str, timeout: Duration, error: ClientError) -> DaemonError {
	let fork = fork.to_string();
	match error {
		ClientError::ConnectTimeout | ClientError::Connect(_) => DaemonError::RelayConnect {
			fork,
			message: error.to_string(),
		},
		ClientError::Timeout => DaemonError::RelayTimeout { fork, timeout },
		ClientError::Http(e) => DaemonError::Relay {
			fork,
			message: e.to_string(),
		},
	}
}
