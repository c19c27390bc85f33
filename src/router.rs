use crate::observer::{ObjectSummary, State as AppState};
use axum::{
    Router,
    extract::{
        State as AxumState, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct HealthCheck {
    message: String,
}

pub fn new_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/objects", get(objects))
        .route("/objects/stream", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn objects(AxumState(app_state): AxumState<AppState>) -> Json<Vec<ObjectSummary>> {
    Json(app_state.snapshot().await)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    AxumState(app_state): AxumState<AppState>,
) -> Response {
    tracing::info!("WebSocket client attempting to connect");
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

fn encode(objects: &[ObjectSummary]) -> Message {
    match serde_json::to_string(objects) {
        Ok(json) => Message::Text(json.into()),
        Err(err) => {
            tracing::warn!(%err, "failed to serialize objects for WebSocket");
            Message::Text("{\"error\":\"serialization_failed\"}".into())
        }
    }
}

async fn handle_socket(socket: WebSocket, app_state: AppState) {
    tracing::info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut updates = BroadcastStream::new(app_state.updates.subscribe());

    let initial = app_state.snapshot().await;
    if sender.send(encode(&initial)).await.is_err() {
        tracing::warn!("Failed to send initial objects to WebSocket client");
        return;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            let objects = match update {
                Ok(objects) => objects,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "stream lagged, sending current objects");
                    app_state.snapshot().await
                }
            };
            if sender.send(encode(&objects)).await.is_err() {
                tracing::info!("WebSocket client disconnected");
                return;
            }
        }
        tracing::error!("Broadcast channel closed, ending WebSocket stream");
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                tracing::info!("WebSocket client sent close message");
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        },
        _ = (&mut recv_task) => {
            send_task.abort();
        },
    }

    tracing::info!("WebSocket connection closed");
}

async fn healthz(AxumState(app_state): AxumState<AppState>) -> Response {
    if !app_state.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthCheck {
                message: "waiting for initial listing".into(),
            }),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(HealthCheck {
            message: "ready".into(),
        }),
    )
        .into_response()
}
