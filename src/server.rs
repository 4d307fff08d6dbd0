//! HTTP and websocket front end
//!
//! `GET /ws` upgrades to the viewer protocol channel. `GET /apps` lists the
//! hosts known to the directory, `GET /sessions` the viewers connected here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::relay::RelayService;
use crate::transport::Negotiator;

pub fn router<N: Negotiator>(relay: Arc<RelayService<N>>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade::<N>))
        .route("/apps", get(list_apps::<N>))
        .route("/sessions", get(list_sessions::<N>))
        .with_state(relay)
}

pub async fn serve<N: Negotiator>(
    addr: SocketAddr,
    relay: Arc<RelayService<N>>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Viewers connect to ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, router(relay)).await
}

async fn ws_upgrade<N: Negotiator>(
    State(relay): State<Arc<RelayService<N>>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| accept(relay, socket))
}

async fn accept<N: Negotiator>(relay: Arc<RelayService<N>>, socket: WebSocket) {
    let (sink, stream) = socket.split();

    // Text frames carry packets; pings are answered by axum; close ends the stream.
    let reader = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Read(e.to_string()))),
            })
        })
        .boxed();

    let writer = Box::pin(
        sink.sink_map_err(|e| TransportError::Write(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text)))),
    );

    match relay.connect_viewer(reader, writer) {
        Ok(session) => info!(session = %session.id(), "Viewer connected"),
        Err(e) => warn!("Rejecting viewer: {e}"),
    }
}

async fn list_apps<N: Negotiator>(State(relay): State<Arc<RelayService<N>>>) -> Response {
    match relay.list_hosts().await {
        Ok(apps) => Json(json!({ "apps": apps })).into_response(),
        Err(e) => {
            warn!("Listing hosts failed: {e}");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn list_sessions<N: Negotiator>(State(relay): State<Arc<RelayService<N>>>) -> Response {
    Json(json!({ "mode": relay.mode(), "sessions": relay.sessions() })).into_response()
}
