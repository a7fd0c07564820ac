//! HTTP transports: SSE event stream, websocket, and the POST command
//! channel shared by both bindings.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::models::config::{BusConfig, TransportKind};
use crate::domain::models::event::{EventKind, SubscriptionFilter};
use crate::domain::ports::event_sink::ChannelSink;
use crate::services::progress_bus::ProgressBus;

use super::{CommandRequest, CommandResponse, CommandRouter};

/// Shared state for every HTTP handler (and the stdio loop).
#[derive(Clone)]
pub struct TransportState {
    pub router: Arc<CommandRouter>,
    pub bus: Arc<ProgressBus>,
    pub bus_config: BusConfig,
}

/// Build the router for one HTTP binding. Both bindings accept
/// commands; the event channel matches the binding kind.
pub fn build_app(kind: TransportKind, state: TransportState) -> Router {
    let router = Router::new().route("/command", post(handle_command));
    let router = match kind {
        TransportKind::Sse => router.route("/events", get(handle_sse)),
        TransportKind::Websocket => router.route("/ws", get(handle_ws_upgrade)),
        TransportKind::Stdio => router,
    };
    router.with_state(state)
}

/// Subscription filter from query parameters: `?job=<id>`,
/// `?project=<id>`, or nothing for everything.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    job: Option<Uuid>,
    project: Option<Uuid>,
}

impl FilterParams {
    fn into_filter(self) -> SubscriptionFilter {
        match (self.job, self.project) {
            (Some(job), _) => SubscriptionFilter::Job(job),
            (None, Some(project)) => SubscriptionFilter::Project(project),
            (None, None) => SubscriptionFilter::All,
        }
    }
}

async fn handle_command(
    State(state): State<TransportState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let response = state.router.handle(&addr.ip().to_string(), &request);
    let status = if response.ok {
        axum::http::StatusCode::OK
    } else if response.retry_after.is_some() {
        axum::http::StatusCode::TOO_MANY_REQUESTS
    } else {
        axum::http::StatusCode::BAD_REQUEST
    };
    (status, Json(response))
}

async fn handle_sse(
    State(state): State<TransportState>,
    Query(params): Query<FilterParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = params.into_filter();
    let (sink, rx) = ChannelSink::bounded(state.bus_config.buffer_capacity);
    let subscriber_id = state
        .bus
        .subscribe(TransportKind::Sse, filter, Box::new(sink));
    let guard = SubscriberGuard {
        bus: Arc::clone(&state.bus),
        id: subscriber_id,
    };

    let bus = Arc::clone(&state.bus);
    let stream = futures::stream::unfold(
        (rx, bus, subscriber_id, guard),
        |(mut rx, bus, id, guard)| async move {
            let event = rx.recv().await?;
            // SSE is one-way: draining a heartbeat from the buffer is
            // the ACK.
            if event.event == EventKind::Heartbeat {
                bus.ack(id);
            }
            let sse_event = Event::default()
                .event(event.event.as_str())
                .data(serde_json::to_string(&event).unwrap_or_default());
            Some((Ok(sse_event), (rx, bus, id, guard)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_ws_upgrade(
    State(state): State<TransportState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<FilterParams>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let filter = params.into_filter();
    upgrade.on_upgrade(move |socket| handle_ws(socket, state, filter, addr))
}

async fn handle_ws(
    socket: WebSocket,
    state: TransportState,
    filter: SubscriptionFilter,
    addr: SocketAddr,
) {
    let (sink, mut rx) = ChannelSink::bounded(state.bus_config.buffer_capacity);
    let subscriber_id = state
        .bus
        .subscribe(TransportKind::Websocket, filter, Box::new(sink));
    let (mut ws_tx, mut ws_rx) = socket.split();
    let key = addr.ip().to_string();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let trimmed = text.trim();
                        if trimmed.eq_ignore_ascii_case("ack") {
                            state.bus.ack(subscriber_id);
                            continue;
                        }
                        let response = match serde_json::from_str::<CommandRequest>(trimmed) {
                            Ok(CommandRequest::Subscribe { .. }) => {
                                // Filter changes require a reconnect; the
                                // subscription was fixed at upgrade time.
                                CommandResponse::error(
                                    "validation",
                                    "subscription filter is set via query parameters",
                                )
                            }
                            Ok(request) => state.router.handle(&key, &request),
                            Err(err) => CommandResponse::error(
                                "validation",
                                format!("unparseable command: {err}"),
                            ),
                        };
                        let Ok(reply) = serde_json::to_string(&response) else { continue };
                        if ws_tx.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => state.bus.ack(subscriber_id),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(subscriber_id);
    tracing::debug!(subscriber = %subscriber_id, "websocket session ended");
}

/// Unsubscribes when the owning stream is dropped.
struct SubscriberGuard {
    bus: Arc<ProgressBus>,
    id: Uuid,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::ProgressEvent;

    #[test]
    fn test_filter_params_precedence() {
        let job = Uuid::new_v4();
        let project = Uuid::new_v4();

        let params = FilterParams {
            job: Some(job),
            project: Some(project),
        };
        assert_eq!(params.into_filter(), SubscriptionFilter::Job(job));

        let params = FilterParams {
            job: None,
            project: Some(project),
        };
        assert_eq!(params.into_filter(), SubscriptionFilter::Project(project));

        assert_eq!(
            FilterParams::default().into_filter(),
            SubscriptionFilter::All
        );
    }

    #[test]
    fn test_sse_event_payload_shape() {
        let event = ProgressEvent::heartbeat();
        let data = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["event"], "heartbeat");
        assert!(value["ts"].is_string());
    }
}
