#![forbid(unsafe_code)]

//! Health probes and the JSON request/response API.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_domain::{RawInbound, RoomId, UserId};
use relay_protocol::codes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::server::router::{MessageRouter, RouteError};

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Clone)]
struct HttpState {
	health: HealthState,
	router: Arc<MessageRouter>,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
	#[serde(default)]
	name: String,
	#[serde(default)]
	creator: String,
	#[serde(default)]
	members: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
	success: bool,
	error: String,
	code: &'a str,
}

pub fn spawn_http_server(bind: SocketAddr, health: HealthState, router: Arc<MessageRouter>) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, HttpState { health, router }).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve(listener, state).await
}

async fn serve(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let query = req.uri().query().unwrap_or_default().to_string();
	let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();

	let resp = match (&method, segments.as_slice()) {
		(&Method::GET, ["healthz"]) => text(StatusCode::OK, "ok"),
		(&Method::GET, ["readyz"]) => {
			if state.health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(&Method::POST, ["api", "send"]) => match read_json::<RawInbound>(req).await {
			Ok(raw) => match state.router.route(raw, None).await {
				Ok(message) => json_response(StatusCode::OK, &json!({ "success": true, "message": message })),
				Err(e) => route_error(&e),
			},
			Err(resp) => resp,
		},
		(&Method::GET, ["api", "messages"]) => direct_history(&state, &query).await,
		(&Method::GET, ["api", "rooms", room_id, "messages"]) => room_history(&state, room_id, &query).await,
		(&Method::POST, ["api", "rooms"]) => match read_json::<CreateRoomRequest>(req).await {
			Ok(body) => create_room(&state, body).await,
			Err(resp) => resp,
		},
		(_, ["healthz" | "readyz"]) | (_, ["api", "send" | "messages" | "rooms"]) | (_, ["api", "rooms", _, "messages"]) => {
			empty(StatusCode::METHOD_NOT_ALLOWED)
		}
		_ => empty(StatusCode::NOT_FOUND),
	};

	debug!(%method, %path, status = resp.status().as_u16(), "http request");
	Ok(resp)
}

async fn direct_history(state: &HttpState, query: &str) -> Response<Full<Bytes>> {
	let (a, b) = match (query_param(query, "a"), query_param(query, "b")) {
		(Some(a), Some(b)) => (UserId::new(a), UserId::new(b)),
		_ => return bad_request("query parameters a and b are required"),
	};
	let (Ok(a), Ok(b)) = (a, b) else {
		return bad_request("query parameters a and b must not be blank");
	};
	let limit = match parse_limit(query) {
		Ok(limit) => limit,
		Err(resp) => return resp,
	};

	match state.router.history_direct(&a, &b, limit).await {
		Ok(messages) => json_response(StatusCode::OK, &json!({ "messages": messages })),
		Err(e) => route_error(&e),
	}
}

async fn room_history(state: &HttpState, room_id: &str, query: &str) -> Response<Full<Bytes>> {
	let Ok(room_id) = urlencoding::decode(room_id) else {
		return bad_request("room id must be valid UTF-8");
	};
	let Ok(room_id) = RoomId::new(room_id.into_owned()) else {
		return bad_request("room id must not be blank");
	};
	let limit = match parse_limit(query) {
		Ok(limit) => limit,
		Err(resp) => return resp,
	};

	match state.router.history_room(&room_id, limit).await {
		Ok(messages) => json_response(StatusCode::OK, &json!({ "messages": messages })),
		Err(e) => route_error(&e),
	}
}

async fn create_room(state: &HttpState, body: CreateRoomRequest) -> Response<Full<Bytes>> {
	let name = body.name.trim();
	if name.is_empty() {
		return bad_request("room name must not be blank");
	}
	let Ok(creator) = UserId::new(body.creator) else {
		return bad_request("creator must not be blank");
	};
	let members = body.members.into_iter().filter_map(|m| UserId::new(m).ok()).collect::<Vec<_>>();

	match state.router.create_room(name, &creator, &members).await {
		Ok(room) => json_response(StatusCode::CREATED, &room),
		Err(e) => route_error(&e),
	}
}

fn query_param(query: &str, name: &str) -> Option<String> {
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

fn parse_limit(query: &str) -> Result<Option<u32>, Response<Full<Bytes>>> {
	match query_param(query, "limit").filter(|v| !v.trim().is_empty()) {
		None => Ok(None),
		Some(v) => v
			.trim()
			.parse::<u32>()
			.map(Some)
			.map_err(|_| bad_request("limit must be a non-negative integer")),
	}
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
	let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			debug!(error = %e, "failed to read request body");
			return Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, codes::INVALID_MESSAGE, "request body too large"));
		}
	};
	serde_json::from_slice(&body).map_err(|e| bad_request(&format!("invalid JSON body: {e}")))
}

fn route_error(e: &RouteError) -> Response<Full<Bytes>> {
	let status = match e {
		RouteError::InvalidMessage(_) | RouteError::SenderMismatch { .. } => StatusCode::BAD_REQUEST,
		RouteError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
	};
	error_response(status, e.code(), &e.to_string())
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
	error_response(StatusCode::BAD_REQUEST, codes::INVALID_MESSAGE, message)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
	json_response(
		status,
		&ErrorBody {
			success: false,
			error: message.to_string(),
			code,
		},
	)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = Response::new(Full::new(Bytes::from(body)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to encode json response");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}
