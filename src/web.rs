//! HTTP front end.
//!
//! Everything happens on `/`:
//!
//! | Request | Response |
//! |---------|----------|
//! | `POST` `application/json` `{"method":"begin","width":W,"height":H,"fps":F}` | `204` |
//! | `POST` `application/json` `{"method":"end"}` | `200` `{"name": path or null}` |
//! | `POST` `application/json` `{"method":"ping"}` | `200` `{"version":1,"recording":bool}` |
//! | `POST` `image/*` | `204`, `400` when not recording |
//! | `POST` `application/octet-stream` (raw RGBA) | `204`, `400` when not recording |
//! | `OPTIONS` | `204` with CORS headers |

use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::encoder::{Geometry, InvalidGeometry};
use crate::frame::FramePayload;
use crate::session::{SessionError, SharedSession};
use crate::PROTOCOL_VERSION;

const ROOT_URI: &str = "/";

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
    #[error("Cannot retire recording at shutdown: {0}")]
    Session(#[from] SessionError),
}

/// Reasons a single request is refused
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Missing Content-Type")]
    MissingContentType,
    #[error("Missing Content-Length")]
    MissingContentLength,
    #[error("Invalid Content-Length '{0}'")]
    InvalidContentLength(String),
    #[error("Content-Length must be positive, got {0}")]
    EmptyBody(i64),
    #[error("Body of {declared} bytes exceeds limit of {max}")]
    TooLarge { declared: u64, max: usize },
    #[error("Cannot read body: {0}")]
    ReadBody(#[from] axum::Error),
    #[error("Body has {actual} bytes, Content-Length says {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unsupported Content-Type '{0}'")]
    UnsupportedContentType(String),
    #[error("Invalid control message: {0}")]
    InvalidControl(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidGeometry(#[from] InvalidGeometry),
    #[error("{0}")]
    Session(#[from] SessionError),
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            RequestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Session(SessionError::NotRecording | SessionError::Frame(_)) => {
                StatusCode::BAD_REQUEST
            }
            RequestError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

// Tell axum how to convert `RequestError` into a response.
impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            debug!("Rejected request: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

/// Control message carried in a JSON body
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ControlMessage {
    Begin { width: u32, height: u32, fps: u32 },
    End,
    Ping,
}

#[derive(Serialize)]
struct EndResponse {
    name: Option<String>,
}

#[derive(Serialize)]
struct PingResponse {
    version: u32,
    recording: bool,
}

#[derive(Clone)]
pub struct Web {
    session: SharedSession,
    max_body_bytes: usize,
}

impl Web {
    pub fn new(session: SharedSession, max_body_bytes: usize) -> Self {
        Web {
            session,
            max_body_bytes,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(ROOT_URI, post(post_handler).options(preflight_handler))
            .layer(middleware::from_fn(cors_middleware))
            .with_state(self)
    }

    /// Serve until shutdown is requested, then retire the active recording.
    pub async fn run(self, subsys: SubsystemHandle, listener: TcpListener) -> Result<(), WebError> {
        let session = self.session.clone();
        let app = self.router();

        info!("Starting HTTP server on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { subsys.on_shutdown_requested().await })
            .await?;

        info!("HTTP server stopped");
        session.shutdown().await?;
        Ok(())
    }
}

/// Middleware that allows any origin on every response
async fn cors_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn preflight_handler() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
        .into_response()
}

async fn post_handler(State(state): State<Web>, request: Request) -> Response {
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(state: &Web, request: Request) -> Result<Response, RequestError> {
    let (parts, body) = request.into_parts();
    let content_type = media_type(&parts.headers)?;
    let declared = content_length(&parts.headers, state.max_body_bytes)?;

    let payload = to_bytes(body, declared).await?;
    if payload.len() != declared {
        return Err(RequestError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    trace!("POST {} with {} bytes", content_type, declared);

    if content_type == "application/json" {
        let message: ControlMessage = serde_json::from_slice(&payload)?;
        return handle_control(state, message).await;
    }

    let frame = if content_type.starts_with("image/") {
        FramePayload::Image(payload)
    } else if content_type == "application/octet-stream" {
        FramePayload::Raw(payload)
    } else {
        return Err(RequestError::UnsupportedContentType(content_type));
    };
    state.session.feed(frame).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_control(state: &Web, message: ControlMessage) -> Result<Response, RequestError> {
    debug!("Control message {:?}", message);
    match message {
        ControlMessage::Ping => {
            let status = state.session.ping()?;
            Ok(Json(PingResponse {
                version: PROTOCOL_VERSION,
                recording: status.recording,
            })
            .into_response())
        }
        ControlMessage::Begin { width, height, fps } => {
            let geometry = Geometry::new(width, height, fps)?;
            state.session.begin(geometry).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        ControlMessage::End => {
            let path = state.session.end().await?;
            Ok(Json(EndResponse {
                name: path.map(|p| p.to_string_lossy().into_owned()),
            })
            .into_response())
        }
    }
}

/// Lower-cased media type of the request, without parameters
fn media_type(headers: &HeaderMap) -> Result<String, RequestError> {
    let value = headers
        .get(header::CONTENT_TYPE)
        .ok_or(RequestError::MissingContentType)?;
    let value = value
        .to_str()
        .map_err(|_| RequestError::UnsupportedContentType(format!("{:?}", value)))?;
    let essence = value.split(';').next().unwrap_or_default().trim();
    Ok(essence.to_ascii_lowercase())
}

fn content_length(headers: &HeaderMap, max: usize) -> Result<usize, RequestError> {
    let value = headers
        .get(header::CONTENT_LENGTH)
        .ok_or(RequestError::MissingContentLength)?;
    let text = String::from_utf8_lossy(value.as_bytes());
    let length: i64 = text
        .trim()
        .parse()
        .map_err(|_| RequestError::InvalidContentLength(text.to_string()))?;
    if length <= 0 {
        return Err(RequestError::EmptyBody(length));
    }
    let length = length as u64;
    if length > max as u64 {
        return Err(RequestError::TooLarge {
            declared: length,
            max,
        });
    }
    Ok(length as usize)
}
