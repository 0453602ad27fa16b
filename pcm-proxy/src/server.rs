use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{response, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::range::{self, RangeError, RangeResponse};
use crate::session::{AudioStreamSession, SessionError};
use crate::wav_header::ContainerHeader;

const TRACK_CONTENT_TYPE: &str = "audio/x-wav";
const SILENCE_CONTENT_TYPE: &str = "audio/wav";
const SILENCE_CHUNK: usize = 64 * 1024;
const NEXT_TRACK_SILENCE_SECS: f64 = 20.0;
/// Only reached for zero-length tracks, whose deadline would otherwise
/// expire before the header is sent.
const MIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ProxyState {
    pub session: AudioStreamSession,
    /// Pause before touching the session, so a previous track's teardown
    /// can settle.
    pub inter_track_delay: Duration,
}

/// Where a running proxy can be reached.
#[derive(Clone, Debug)]
pub struct ProxyHandle {
    pub host: String,
    pub port: u16,
}

impl ProxyHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Playback URL handed to the media player for one track.
    pub fn track_url(&self, track_id: &str, duration_seconds: f64) -> String {
        format!("{}/track/{}/{}", self.base_url(), track_id, duration_seconds)
    }

    pub fn silence_url(&self, duration_seconds: f64) -> String {
        format!("{}/silence/{}", self.base_url(), duration_seconds)
    }
}

pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/track/:track_id/:duration", get(stream_track))
        .route("/silence/:duration", get(silence))
        .route("/nexttrack", get(next_track))
        .with_state(state)
}

/// Bind the proxy (port `0` picks a free one) and serve it until `shutdown`
/// resolves.
pub async fn start_proxy_server(
    state: Arc<ProxyState>,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<(ProxyHandle, JoinHandle<std::io::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let port = listener.local_addr()?.port();
    let app = proxy_router(state);

    info!("pcm-proxy listening on http://{}:{}", host, port);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });

    Ok((
        ProxyHandle {
            host: host.to_string(),
            port,
        },
        task,
    ))
}

/// Deadline for a whole track body: one and a half times real time.
pub fn response_timeout(duration_seconds: f64) -> Duration {
    let secs = (duration_seconds.max(0.0) * 1.5).ceil();
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::MAX)
        .max(MIN_RESPONSE_TIMEOUT)
}

fn parse_duration(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|d| d.is_finite())
}

fn bad_duration(raw: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("invalid duration: {raw}")).into_response()
}

fn range_error_response(err: RangeError) -> Response {
    warn!("Rejecting range request: {err}");
    (err.status(), err.to_string()).into_response()
}

fn track_headers(range: &RangeResponse) -> response::Builder {
    let mut builder = Response::builder()
        .status(range.status)
        .header(CONTENT_TYPE, TRACK_CONTENT_TYPE)
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, range.content_length.to_string());
    if let Some(content_range) = &range.content_range {
        builder = builder.header(CONTENT_RANGE, content_range);
    }
    builder
}

fn finish(builder: response::Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        error!("Failed to build response: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

async fn index() -> &'static str {
    "Server started"
}

async fn health(State(state): State<Arc<ProxyState>>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "session": format!("{:?}", state.session.state()).to_lowercase(),
        "live_decoders": state.session.supervisor().live_handles(),
    });

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn stream_track(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    headers: HeaderMap,
    Path((track_id, raw_duration)): Path<(String, String)>,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(duration) = parse_duration(&raw_duration) else {
        return bad_duration(&raw_duration);
    };
    let range_header = headers.get(RANGE).and_then(|v| v.to_str().ok());
    debug!(
        "{} request for track '{}' ({}s), range {:?}",
        method, track_id, duration, range_header
    );

    // HEAD only needs the length, which does not depend on session state.
    if method == Method::HEAD {
        let total_length = ContainerHeader::synthesize(duration).total_length();
        return match range::translate(range_header, total_length) {
            Ok(range) => finish(track_headers(&range), Body::empty()),
            Err(e) => range_error_response(e),
        };
    }

    if !state.inter_track_delay.is_zero() {
        tokio::time::sleep(state.inter_track_delay).await;
    }

    info!("Start streaming track '{}'", track_id);
    let track = state
        .session
        .preempt_and_set_track(&track_id, duration)
        .await;

    let range = match range::translate(range_header, track.total_length()) {
        Ok(range) => range,
        Err(e) => return range_error_response(e),
    };
    if range.is_full() {
        debug!("Full file requested, size {}", range.total_length);
        state.session.hooks().full_resource_requested().await;
    } else {
        debug!(
            "Partial request range: {:?}, length: {}",
            range.content_range, range.content_length
        );
    }

    let chunks = match state
        .session
        .send_track_range(&track, range.body_len(), range.start)
        .await
    {
        Ok(chunks) => chunks,
        Err(e @ SessionError::Superseded(_)) => {
            return (StatusCode::CONFLICT, e.to_string()).into_response();
        }
        Err(e) => {
            error!("Streaming error for track '{}': {}", track_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Streaming error: {e}"),
            )
                .into_response();
        }
    };

    let deadline = tokio::time::sleep(response_timeout(duration));
    let body = Body::from_stream(chunks.take_until(deadline));
    finish(track_headers(&range), body)
}

async fn silence(Path(raw_duration): Path<String>) -> Response {
    match parse_duration(&raw_duration) {
        Some(duration) => silence_response(duration),
        None => bad_duration(&raw_duration),
    }
}

async fn next_track() -> Response {
    debug!("Playing silence while the player waits for the next track");
    silence_response(NEXT_TRACK_SILENCE_SECS)
}

/// A header followed by zeroed samples, produced lazily.
fn silence_response(duration: f64) -> Response {
    let header = ContainerHeader::synthesize(duration);
    let data_size = header.data_size();
    let zeros = Bytes::from(vec![0u8; SILENCE_CHUNK]);

    let head = futures::stream::once(futures::future::ready(Ok::<_, std::io::Error>(
        Bytes::copy_from_slice(header.bytes()),
    )));
    let samples = futures::stream::iter(
        (0..data_size.div_ceil(SILENCE_CHUNK as u64)).map(move |i| {
            let remaining = data_size - i * SILENCE_CHUNK as u64;
            let len = remaining.min(SILENCE_CHUNK as u64) as usize;
            Ok(zeros.slice(..len))
        }),
    );

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, SILENCE_CONTENT_TYPE)
        .header(CONTENT_LENGTH, header.total_length().to_string())
        .header(
            CONTENT_DISPOSITION,
            format!("inline; filename=\"{duration}.wav\""),
        );
    finish(builder, Body::from_stream(head.chain(samples)))
}
