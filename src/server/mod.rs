//! HTTP surface: thread listing/creation, event append/read, live SSE
//! streaming, derived state, and presence (`spec.md` §6.1).
//!
//! Routing follows the teacher's `mcp_http_adapter.rs` shape (a `Router`
//! built once at startup, handed a cloned `AppState`), grounded further by
//! `other_examples/.../mira-chat-src-server.rs` for the SSE handler, whose
//! `async_stream::stream!` macro this crate does not depend on — the pack
//! carries no `async-stream`/`tokio-stream` crate, so the channel-to-stream
//! bridge below is hand-written over `futures_util::stream::Stream`.

use crate::error::StoreError;
use crate::event::{Event, ThreadState};
use crate::presence::PresenceRegistry;
use crate::store::{NewEvent, Store};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub presence: Arc<PresenceRegistry>,
}

/// Build the router. Call `.with_state` is already applied; the returned
/// `Router` is ready for `axum::serve`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/threads", get(list_threads).post(create_thread))
        .route("/threads/{id}/events", get(get_events).post(post_event))
        .route("/threads/{id}/events/stream", get(stream_events))
        .route("/threads/{id}/state", get(get_state))
        .route(
            "/threads/{id}/presence",
            get(get_presence).post(post_presence),
        )
        .with_state(state)
}

/// Bind and serve forever. Returns only on a listener/accept failure.
pub async fn run(addr: std::net::SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("bridge-server listening on {addr}", addr = listener.local_addr()?);
    serve(listener, state).await
}

/// Serve forever on an already-bound listener. Split out from [`run`] so
/// tests (and anything else wanting an ephemeral port) can bind with port
/// `0`, read back the OS-assigned address via `TcpListener::local_addr`,
/// and only then start serving.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let app = create_router(state);
    axum::serve(listener, app).await
}

async fn list_threads(State(state): State<AppState>) -> Json<Value> {
    let threads = state.store.list_threads().await;
    Json(json!({ "threads": threads }))
}

#[derive(Debug, Deserialize)]
struct CreateThreadBody {
    name: Option<String>,
    from: Option<String>,
}

async fn create_thread(
    State(state): State<AppState>,
    body: Option<Json<CreateThreadBody>>,
) -> Result<Json<Value>, StoreError> {
    let body = body.map(|Json(b)| b).unwrap_or(CreateThreadBody {
        name: None,
        from: None,
    });
    let thread = state.store.create_thread(body.name, body.from).await?;
    Ok(Json(json!({ "id": thread.id, "name": thread.name })))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

async fn get_events(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Value>, StoreError> {
    if state.store.get_thread(&thread_id).await.is_none() {
        return Err(StoreError::ThreadNotFound(thread_id));
    }
    let events = state.store.read_events(&thread_id, query.since)?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

async fn post_event(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(new_event): Json<NewEvent>,
) -> Result<Json<Value>, StoreError> {
    let event = state.store.append_event(&thread_id, new_event).await?;
    Ok(Json(json!({ "received": true, "event": event })))
}

async fn get_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, StoreError> {
    if state.store.get_thread(&thread_id).await.is_none() {
        return Err(StoreError::ThreadNotFound(thread_id));
    }
    let events = state.store.read_events(&thread_id, None)?;
    let derived = ThreadState::reduce(&events);
    let mut muted: Vec<&String> = derived.muted.iter().collect();
    muted.sort();
    Ok(Json(json!({
        "thread": thread_id,
        "state": {
            "paused": derived.paused,
            "muted": muted,
            "discussion": derived.discussion,
        }
    })))
}

async fn get_presence(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Json<Value> {
    let participants = state.presence.snapshot(&thread_id).await;
    Json(json!({
        "thread": thread_id,
        "ttl_seconds": crate::presence::PRESENCE_TTL_SECS,
        "participants": participants,
    }))
}

#[derive(Debug, Deserialize)]
struct PresenceBody {
    from: String,
    state: String,
    details: Option<Value>,
}

async fn post_presence(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<PresenceBody>,
) -> Json<Value> {
    state
        .presence
        .set(&thread_id, &body.from, &body.state, body.details)
        .await;
    let presence = state
        .presence
        .snapshot(&thread_id)
        .await
        .into_iter()
        .find(|p| p.id == body.from);
    Json(json!({ "received": true, "presence": presence }))
}

/// How often the SSE loop re-scans the thread log for events past its cursor.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Adapts an `mpsc::Receiver` into a `futures_util::Stream`, since the pack
/// has no `tokio-stream` dependency to supply `ReceiverStream`.
struct ReceiverStream<T> {
    inner: mpsc::Receiver<T>,
}

impl<T> Stream for ReceiverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_recv(cx)
    }
}

async fn stream_events(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(64);

    tokio::spawn(async move {
        let mut cursor = match query.since {
            Some(since) => Some(since),
            None => state
                .store
                .read_events(&thread_id, None)
                .ok()
                .and_then(|events| events.last().map(|e| e.ts)),
        };
        loop {
            let events = match state.store.read_events(&thread_id, cursor) {
                Ok(events) => events,
                Err(_) => break,
            };
            for event in events {
                cursor = Some(event.ts);
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    });

    let stream = ReceiverStream { inner: rx }.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
