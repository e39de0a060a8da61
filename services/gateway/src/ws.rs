//! HTTP surface: the WebSocket upgrade endpoint and the publish endpoint.
//!
//! Thin adapter only — everything interesting happens in the endpoint loops,
//! the router, and the delivery engine. Embedders nest [`api_router`] under
//! whatever paths they like and may swap the client-id generator.

use crate::delivery::Delivery;
use crate::endpoint::{self, Endpoint, MAX_MESSAGE_SIZE};
use crate::registry::EventRegistry;
use crate::router::Router;
use crate::task::spawn_guarded;
use axum::Json;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures_util::StreamExt;
use rp_protocol::{Event, next_event_id, now_millis};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Produces the stable subscriber id for an upgrading request.
pub type ClientIdGenerator = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<Router>,
    pub delivery: Arc<Delivery>,
    pub registry: Arc<EventRegistry>,
    pub id_gen: ClientIdGenerator,
}

impl GatewayState {
    pub fn new(
        router: Arc<Router>,
        delivery: Arc<Delivery>,
        registry: Arc<EventRegistry>,
    ) -> Self {
        Self {
            router,
            delivery,
            registry,
            id_gen: Arc::new(|_| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replace the default (UUIDv4) subscriber-id generator.
    pub fn with_id_generator(mut self, id_gen: ClientIdGenerator) -> Self {
        self.id_gen = id_gen;
        self
    }
}

/// Routes served by the gateway: `GET /ws` and `POST /publish`.
pub fn api_router(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/publish", post(publish_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// WebSocket upgrade
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let id = (state.id_gen)(&headers);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(socket, state, id))
}

async fn serve_socket(socket: WebSocket, state: GatewayState, id: String) {
    info!(subscriber = %id, "subscriber connected");
    let (sink, stream) = socket.split();
    let (endpoint, outbound_rx) = Endpoint::new(id);

    state.delivery.spawn_resend_monitor(Arc::clone(&endpoint));
    spawn_guarded(
        "write-loop",
        endpoint::write_loop(
            sink,
            outbound_rx,
            Arc::clone(&endpoint),
            Arc::clone(&state.router),
        ),
    );
    {
        // Replay anything this subscriber missed while away.
        let delivery = Arc::clone(&state.delivery);
        let endpoint = Arc::clone(&endpoint);
        spawn_guarded("offline-replay", async move {
            delivery.pull_offline(&endpoint).await;
        });
    }

    endpoint::read_loop(
        stream,
        endpoint,
        state.router,
        state.delivery,
        state.registry,
    )
    .await;
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    pub event: Event,
}

/// Accept a publisher payload: fill in a missing id/time, then hand it to
/// the router's publish path. Always 202 once accepted — delivery failures
/// are repaired by replay, never reported here.
async fn publish_handler(
    State(state): State<GatewayState>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    if request.channel.is_empty() {
        return (StatusCode::UNPROCESSABLE_ENTITY, "channel is required").into_response();
    }
    let mut event = request.event;
    if event.id.is_empty() {
        event.id = next_event_id();
    }
    if event.time == 0 {
        event.time = now_millis();
    }
    let Ok(payload) = event.to_bytes() else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "unencodable event").into_response();
    };
    state.router.publish(&request.channel, &payload).await;
    StatusCode::ACCEPTED.into_response()
}
