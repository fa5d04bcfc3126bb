//! HTTP transport for [`sdstream_core`]: `GET /health` and a `POST /generate`
//! that streams a generation as server-sent events.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use sdstream_core::{Error, Pipeline};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

mod wire;

pub use wire::{decode_source_image, ErrorBody, ErrorDetail, GenerateBody, StreamFrame};

/// Frames buffered between the generation thread and the client. Generation
/// blocks until the previous frame has been taken.
const FRAME_BUFFER: usize = 1;
const DONE: &str = "[DONE]";

/// What to do with a request that arrives while a generation is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BusyPolicy {
    /// Wait for the running generation to finish.
    #[default]
    Queue,
    /// Answer `503 Service Unavailable`.
    Reject,
}

pub struct AppState {
    pipeline: Arc<Pipeline>,
    busy: BusyPolicy,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, busy: BusyPolicy) -> Self {
        Self { pipeline, busy }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .with_state(Arc::new(state))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn error_response(status: StatusCode, message: String, kind: &'static str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail { message, kind },
        }),
    )
        .into_response()
}

fn session_error_response(err: Error) -> Response {
    match err {
        Error::Busy => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            err.to_string(),
            "server_busy",
        ),
        Error::Validation(_) | Error::ModelNotReady(_) => {
            error_response(StatusCode::BAD_REQUEST, err.to_string(), "server_error")
        }
        Error::Inference { .. } | Error::Incomplete => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "server_error",
        ),
    }
}

fn frame_event(frame: &StreamFrame) -> Event {
    match serde_json::to_string(frame) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            error!("cannot serialize stream frame: {e}");
            Event::default().data(r#"{"type":"error","message":"internal serialization error"}"#)
        }
    }
}

async fn generate(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body = match GenerateBody::parse(&body) {
        Ok(body) => body,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message, "server_error"),
    };
    let pipeline = state.pipeline.clone();
    let mut request = body.to_generation_request(pipeline.has_safety_checker());
    if let Err(err) = request.validate(pipeline.scheduler_config().train_timesteps) {
        return session_error_response(err);
    }
    info!(
        "generate: prompt={:?} negative_prompt={:?} steps={} cfg={} use_cfg={} size={} denoise_strength={} seed={} image={}",
        request.prompt,
        request.negative_prompt,
        request.steps,
        request.guidance_scale,
        request.use_guidance,
        request.size,
        request.denoise_strength,
        request.seed,
        body.image.is_some(),
    );

    let (frames_tx, frames_rx) = mpsc::channel::<StreamFrame>(FRAME_BUFFER);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), Error>>();
    let busy = state.busy;
    tokio::task::spawn_blocking(move || {
        if let Some(encoded) = &body.image {
            request.source_image = decode_source_image(encoded, request.size);
        }
        let session = match busy {
            BusyPolicy::Queue => pipeline.session(request),
            BusyPolicy::Reject => pipeline.try_session(request),
        };
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        if ready_tx.send(Ok(())).is_err() {
            info!("client left while queued, dropping generation");
            return;
        }
        for event in session {
            if frames_tx.blocking_send(StreamFrame::from(event)).is_err() {
                info!("client disconnected, cancelling generation");
                break;
            }
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => return session_error_response(err),
        Err(_) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "generation worker stopped unexpectedly".to_string(),
                "server_error",
            )
        }
    }

    // The channel closes after the final frame; `[DONE]` terminates the stream.
    let events = stream::unfold((frames_rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        let (event, done) = match rx.recv().await {
            Some(frame) => (frame_event(&frame), false),
            None => (Event::default().data(DONE), true),
        };
        Some((Ok::<_, Infallible>(event), (rx, done)))
    });
    Sse::new(events).into_response()
}
