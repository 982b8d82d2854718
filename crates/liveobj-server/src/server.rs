//! HTTP server implementation using Axum: one WebSocket route per object
//! server plus a health check.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use liveobj_core::{Channel, Frame, Server};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Start the HTTP server and serve `server` on `path`.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    server: Server,
    host: &str,
    port: u16,
    path: &str,
) -> anyhow::Result<SocketAddr> {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route(path, get(handle_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {} (objects at {})", actual_addr, path);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

async fn handle_health(State(server): State<Server>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": server.connection_count(),
    }))
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(server): State<Server>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(server, socket))
}

/// Bridge one WebSocket to a [`Channel`] and run a session on it.
async fn serve_socket(server: Server, socket: WebSocket) {
    let (mut ws_write, mut ws_read) = socket.split();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
            };
            if ws_write.send(msg).await.is_err() {
                warn!("WebSocket write failed, closing write loop");
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    tokio::spawn(async move {
        while let Some(result) = ws_read.next().await {
            let frame = match result {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(data)) => Frame::Binary(Bytes::from(data)),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
            };
            if in_tx.send(frame).is_err() {
                break;
            }
        }
    });

    if let Err(e) = server.serve(Channel::new(in_rx, out_tx)).await {
        warn!("Refusing WebSocket session: {}", e);
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use liveobj_core::{Client, ClientOptions, ServerOptions, Value, WsConnector};
    use std::time::Duration;

    async fn start() -> (Server, SocketAddr) {
        let server = Server::new(demo::registry().unwrap(), ServerOptions::default());
        demo::populate(&server);
        server.start();
        let addr = start_server(server.clone(), "127.0.0.1", 0, "/liveobj")
            .await
            .unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_server_starts() {
        let (_server, addr) = start().await;
        assert!(addr.port() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_websocket_end_to_end() {
        let (server, addr) = start().await;
        let url = format!("ws://{}/liveobj", addr);
        let client = Client::connect(WsConnector::new(url), ClientOptions::default())
            .await
            .unwrap();

        let thing = client.get_object(demo::TEST_OBJECT_NAME).await.unwrap();
        assert_eq!(thing.get("color"), Some(Value::from("blue")));
        assert_eq!(
            thing.call("speak", vec![Value::from("hi")]).await.unwrap(),
            Value::from("hi, my color is blue")
        );

        let owner = liveobj_core::RemoteProxy::from_value(&thing.get("owner").unwrap()).unwrap();
        assert_eq!(
            owner.call_local("describe", &[]).unwrap(),
            Value::from("Jay is 37 years old")
        );

        let sum = client
            .root()
            .unwrap()
            .call("sum", vec![Value::from(2), Value::from(3)])
            .await
            .unwrap();
        assert_eq!(sum.as_f64(), Some(5.0));

        let map = thing.call("getMap", vec![]).await.unwrap();
        let map = map
            .as_object()
            .and_then(|o| o.downcast::<liveobj_core::RemoteMap>())
            .unwrap();
        assert_eq!(map.get(&Value::from(55)), Some(&Value::from("qué tal")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = client
            .listen(&thing, "tick", move |_source, args| {
                let _ = tx.send(args.len());
            })
            .await
            .unwrap();

        let thing_object = server.named(demo::TEST_OBJECT_NAME).unwrap();
        server
            .fire_event(&thing_object, "tick", vec![Value::from(1)])
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(1));

        client.unlisten(&thing, "tick", listener).await.unwrap();
        assert_eq!(server.fire_event(&thing_object, "tick", vec![]).unwrap(), 0);

        client.shutdown();
    }
}
