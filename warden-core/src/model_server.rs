//! Model server: the engine's wire surface.
//!
//! Read-only snapshots of the resolver state plus the binding change-stream
//! as server-sent events. Dashboards, auth and recording live in external
//! services; this is deliberately minimal.
//!
//! Routes:
//! - `GET /events` — SSE change-stream (requires `Accept: text/event-stream`)
//! - `GET /persons` — active person snapshots
//! - `GET /persons/{id}` — one person
//! - `POST /persons/{id}/name` — assign a display name
//! - `GET /count?cameras=1,2` — de-duplicated room count
//! - `GET /stats` — resolver statistics

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::StreamExt;
use http::{header::ACCEPT, request::Parts, StatusCode};
use http_body::Frame;
use serde::Deserialize;
use tokio::sync::mpsc::Sender;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use warden_types::{CamId, Event, GlobalId};

use crate::resolver::GlobalResolver;
use crate::Result;

const EVENTS_PATH: &str = "/events";
const SSE_EVENT_NAME: &str = "warden";

type EventChunkSender = Sender<std::result::Result<Frame<Bytes>, Infallible>>;
type EventReceiver = ReceiverStream<std::result::Result<Frame<Bytes>, Infallible>>;

// header extractor for "Accept: text/event-stream" --------------------------

struct AcceptsEventStream;

impl<S> axum::extract::FromRequestParts<S> for AcceptsEventStream
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);
    async fn from_request_parts(p: &mut Parts, _: &S) -> std::result::Result<Self, Self::Rejection> {
        const ES: &[u8] = b"text/event-stream";
        if p.headers.get_all(ACCEPT).iter().any(|v| v.as_bytes() == ES) {
            Ok(AcceptsEventStream)
        } else {
            Err((
                StatusCode::BAD_REQUEST,
                "Bad request: the \"Accept: text/event-stream\" header is required here",
            ))
        }
    }
}

// events body ---------------------------

struct EventsBody {
    events: EventReceiver,
}

impl http_body::Body for EventsBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.events.poll_next_unpin(cx)
    }
}

impl IntoResponse for EventsBody {
    fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(axum::body::Body::new(self));
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::header::HeaderValue::from_static("text/event-stream"),
        );
        response
    }
}

/// Fans event frames out to every connected listener, dropping connections
/// that closed.
#[derive(Clone, Default)]
struct EventBroadcaster {
    txers: Arc<RwLock<HashMap<usize, EventChunkSender>>>,
}

impl EventBroadcaster {
    fn new_connection(&self, key: usize) -> EventsBody {
        let (tx, rx) = tokio::sync::mpsc::channel(10);
        self.txers.write().unwrap().insert(key, tx);
        EventsBody {
            events: ReceiverStream::new(rx),
        }
    }

    async fn broadcast_frame(&self, frame_string: String) {
        // Move all listeners out of the shared map so nothing is held across
        // the awaits below.
        let txers: Vec<_> = { self.txers.write().unwrap().drain().collect() };

        let mut keep = Vec::with_capacity(txers.len());
        for (key, tx) in txers {
            match tx.send(Ok(Frame::data(frame_string.clone().into()))).await {
                Ok(()) => keep.push((key, tx)),
                Err(_) => {
                    // Receiver dropped: the connection closed.
                    debug!("dropping closed event-stream connection {key}");
                }
            }
        }

        let mut txers = self.txers.write().unwrap();
        for (key, tx) in keep {
            txers.insert(key, tx);
        }
    }
}

#[derive(Clone)]
struct AppState {
    resolver: GlobalResolver,
    event_broadcaster: EventBroadcaster,
    next_connection_id: Arc<RwLock<usize>>,
}

fn format_sse_event(event: &Event) -> String {
    let data = serde_json::to_string(event).expect("event serializes");
    format!("event: {SSE_EVENT_NAME}\ndata: {data}\n\n")
}

async fn events_handler(
    State(state): State<AppState>,
    _: AcceptsEventStream,
) -> impl IntoResponse {
    let key = {
        let mut next = state.next_connection_id.write().unwrap();
        let key = *next;
        *next += 1;
        key
    };
    state.event_broadcaster.new_connection(key)
}

async fn persons_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.resolver.list_active())
}

async fn person_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> std::result::Result<impl IntoResponse, StatusCode> {
    state
        .resolver
        .get(GlobalId(id))
        .map(axum::Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct SetNameBody {
    name: String,
}

async fn set_name_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    axum::Json(body): axum::Json<SetNameBody>,
) -> std::result::Result<StatusCode, StatusCode> {
    state
        .resolver
        .set_name(GlobalId(id), &body.name)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|_| StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct CountQuery {
    cameras: String,
}

fn parse_cameras(raw: &str) -> Option<Vec<CamId>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse::<u32>().ok().map(CamId))
        .collect()
}

async fn count_handler(
    State(state): State<AppState>,
    Query(q): Query<CountQuery>,
) -> std::result::Result<impl IntoResponse, StatusCode> {
    let cameras = parse_cameras(&q.cameras).ok_or(StatusCode::BAD_REQUEST)?;
    let count = state.resolver.count_in_room(&cameras);
    Ok(axum::Json(serde_json::json!({ "count": count })))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.resolver.stats())
}

/// Serve the model server until cancelled.
pub async fn new_model_server(
    resolver: GlobalResolver,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let state = AppState {
        resolver: resolver.clone(),
        event_broadcaster: EventBroadcaster::default(),
        next_connection_id: Arc::new(RwLock::new(0)),
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let router = axum::Router::new()
        .route(EVENTS_PATH, axum::routing::get(events_handler))
        .route("/persons", axum::routing::get(persons_handler))
        .route("/persons/{id}", axum::routing::get(person_handler))
        .route("/persons/{id}/name", axum::routing::post(set_name_handler))
        .route("/count", axum::routing::get(count_handler))
        .route("/stats", axum::routing::get(stats_handler))
        .with_state(state.clone());

    info!("model server at http://{local_addr}/ (events at {EVENTS_PATH})");

    let http_serve_future = axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();

    // Relay resolver events into the SSE broadcaster.
    let relay_future = async move {
        let mut rx = resolver.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = rx.recv() => match recv {
                    Ok(event) => {
                        state
                            .event_broadcaster
                            .broadcast_frame(format_sse_event(&event))
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Bounded queue semantics: slow relay loses oldest.
                        debug!("event relay lagged; {n} events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    };

    tokio::select! {
        result = http_serve_future => { result?; }
        _ = relay_future => {}
    }

    Ok(())
}
