// HTTP listener for audience feedback (`POST /feedback`).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use livechat_core::feedback::{FeedbackCollector, FeedbackRejection};
use livechat_core::identity;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::ws_server::FORWARDED_FOR_HEADER;

pub const FEEDBACK_PATH: &str = "/feedback";

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 20_000;

pub const ERR_INVALID_JSON: &str = "invalid_json";
pub const ERR_PAYLOAD_TOO_LARGE: &str = "payload_too_large";
pub const ERR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
pub const ERR_NOT_FOUND: &str = "not_found";

pub struct HttpListener {
    listener: TcpListener,
}

impl HttpListener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[derive(Clone)]
pub struct FeedbackEndpoint {
    collector: Arc<FeedbackCollector>,
    trust_forwarded_for: bool,
}

impl FeedbackEndpoint {
    pub fn new(collector: Arc<FeedbackCollector>, trust_forwarded_for: bool) -> Self {
        Self {
            collector,
            trust_forwarded_for,
        }
    }
}

pub async fn run(listener: HttpListener, endpoint: FeedbackEndpoint) -> anyhow::Result<()> {
    info!("feedback HTTP server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.listener.accept().await?;
        let io = TokioIo::new(stream);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, peer, endpoint.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %err, %peer, "HTTP connection error");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    peer: SocketAddr,
    endpoint: FeedbackEndpoint,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != FEEDBACK_PATH {
        return Ok(json_response(StatusCode::NOT_FOUND, &error_body(ERR_NOT_FOUND)));
    }
    if req.method() != Method::POST {
        let mut resp = json_response(StatusCode::METHOD_NOT_ALLOWED, &error_body(ERR_METHOD_NOT_ALLOWED));
        resp.headers_mut().insert(ALLOW, HeaderValue::from_static("POST"));
        return Ok(resp);
    }

    let declared_len = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Ok(json_response(StatusCode::PAYLOAD_TOO_LARGE, &error_body(ERR_PAYLOAD_TOO_LARGE)));
    }

    let forwarded_for = req
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let identity = identity::resolve(Some(peer.ip()), forwarded_for.as_deref(), endpoint.trust_forwarded_for);

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Ok(json_response(StatusCode::PAYLOAD_TOO_LARGE, &error_body(ERR_PAYLOAD_TOO_LARGE)));
        }
        Err(e) => {
            warn!(%peer, "failed to read feedback body: {e}");
            return Ok(json_response(StatusCode::BAD_REQUEST, &error_body(ERR_INVALID_JSON)));
        }
    };

    let (status, body) = feedback_response(&endpoint.collector, identity.as_deref(), &body);
    Ok(json_response(status, &body))
}

/// Evaluate one feedback submission and build the HTTP status and JSON body.
pub fn feedback_response(collector: &FeedbackCollector, identity: Option<&str>, body: &[u8]) -> (StatusCode, Value) {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) | Err(_) => return (StatusCode::BAD_REQUEST, error_body(ERR_INVALID_JSON)),
    };
    let rating = payload.get("rating").and_then(Value::as_i64);
    let comment = payload.get("comment").and_then(Value::as_str);

    match collector.submit(identity, rating, comment) {
        Ok(submission) => {
            info!(cycle_id = submission.cycle_id, rating = submission.rating, "feedback accepted");
            (StatusCode::OK, json!({ "ok": true }))
        }
        Err(rejection) => {
            debug!(reason = rejection.code(), "feedback rejected");
            (rejection_status(&rejection), error_body(rejection.code()))
        }
    }
}

pub fn rejection_status(rejection: &FeedbackRejection) -> StatusCode {
    match rejection {
        FeedbackRejection::Disabled => StatusCode::FORBIDDEN,
        FeedbackRejection::IpUnknown => StatusCode::BAD_REQUEST,
        FeedbackRejection::AlreadySubmitted => StatusCode::CONFLICT,
        FeedbackRejection::InvalidRating => StatusCode::BAD_REQUEST,
    }
}

fn error_body(code: &str) -> Value {
    json!({ "ok": false, "error": code })
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}
