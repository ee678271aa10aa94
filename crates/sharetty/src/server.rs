//! HTTP and WebSocket front end.
//!
//! Serves the browser terminal page and attaches every WebSocket connection
//! to the shared session through the [`BroadcastHub`].

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientRequest, ServerMessage};

use crate::session::{BroadcastHub, HubError, Outbound, RegistryError, SessionError};

/// Browser client served at `/`.
const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(hub: Arc<BroadcastHub>, max_message_size: usize) -> Self {
        Self {
            hub,
            max_message_size,
        }
    }
}

/// Builds the application router.
///
/// `/ws/:room` is accepted for compatibility with clients that put a room
/// name in the path. There is a single shared session, so the room is
/// ignored.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/ws/:room", get(ws_room_handler))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_room_handler(
    State(state): State<AppState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(room = %room, "Room requested, using the shared session");
    upgrade(state, ws).await
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    upgrade(state, ws).await
}

async fn upgrade(state: AppState, ws: WebSocketUpgrade) -> Response {
    if !state.hub.session().is_running() {
        return (StatusCode::GONE, "session has ended").into_response();
    }
    if !state.hub.is_accepting().await {
        tracing::warn!(
            max_clients = state.hub.registry().max_clients(),
            "Rejecting connection, client limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many clients").into_response();
    }

    let hub = state.hub;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(hub, socket))
}

/// Drives one client connection until either side goes away.
///
/// Output and control messages flow out through a writer task fed by the
/// client's queue. Frames read from the socket are decoded into input or
/// resize requests for the hub. When either direction stops the other is
/// aborted and the client is detached.
pub async fn handle_socket(hub: Arc<BroadcastHub>, mut socket: WebSocket) {
    let attachment = match hub.on_client_join().await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to attach client");
            let code = match e {
                HubError::Registry(RegistryError::Full { .. }) => close_code::AGAIN,
                _ => close_code::AWAY,
            };
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(e.to_string()),
                })))
                .await;
            return;
        }
    };

    let client_id = attachment.id;
    let mut outbound = attachment.outbound;
    let session_end = attachment.session_end;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match message {
                Outbound::Output(data) => Message::Binary(data.to_vec()),
                Outbound::Control(control) => match control.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode control message");
                        continue;
                    }
                },
            };
            if sender.send(frame).await.is_err() {
                return;
            }
        }

        // Queue closed: the registry let go of this client. If that is
        // because the session ended, say how before closing.
        let outcome = *session_end.borrow();
        if let Some(outcome) = outcome {
            match (ServerMessage::Exit { code: outcome.exit_code }).to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode exit message"),
            }
        }

        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Cow::Borrowed("session ended"),
            })))
            .await;
    });

    let mut recv_task = {
        let hub = Arc::clone(&hub);
        let client_id = client_id.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(client_id = %client_id, error = %e, "WebSocket read failed");
                        break;
                    }
                };

                let request = match message {
                    Message::Binary(data) => ClientRequest::from_binary(data),
                    Message::Text(text) => match ClientRequest::from_text(&text) {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::warn!(client_id = %client_id, error = %e, "Ignoring malformed message");
                            continue;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let result = match request {
                    ClientRequest::Input(data) => hub.on_client_input(&client_id, &data).await,
                    ClientRequest::Resize(size) => hub.on_client_resize(&client_id, size).await,
                };

                match result {
                    Ok(()) => {}
                    Err(HubError::Session(SessionError::Terminated))
                    | Err(HubError::SessionEnded)
                    | Err(HubError::Registry(RegistryError::NotFound(_))) => {
                        tracing::debug!(client_id = %client_id, "Dropping request, session is gone");
                    }
                    Err(e) => {
                        tracing::warn!(client_id = %client_id, error = %e, "Failed to apply client request");
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.on_client_leave(&client_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientRegistry, Session, SessionOptions};
    use protocol::TerminalSize;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(max_clients: usize) -> (SocketAddr, Arc<BroadcastHub>) {
        let session = Session::start(SessionOptions {
            shell: Some("/bin/sh".to_string()),
            ..SessionOptions::default()
        })
        .expect("failed to start session");
        let output = session.read_output().unwrap();
        let hub = Arc::new(BroadcastHub::new(
            Arc::new(session),
            Arc::new(ClientRegistry::with_limits(max_clients, 64)),
        ));

        {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.run(output).await });
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState::new(Arc::clone(&hub), 64 * 1024));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, hub)
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", addr, path))
            .await
            .expect("failed to connect");
        ws
    }

    /// Waits for the next `users` message.
    async fn next_users(ws: &mut Client) -> Option<usize> {
        loop {
            match timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Ok(ServerMessage::Users { count }) = ServerMessage::from_json(&text) {
                        return Some(count);
                    }
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    async fn read_until(ws: &mut Client, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..100 {
            match timeout(Duration::from_millis(100), ws.next()).await {
                Ok(Some(Ok(WsMessage::Binary(data)))) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(Some(Ok(_))) | Err(_) => {}
                Ok(Some(Err(_))) | Ok(None) => return false,
            }
        }
        false
    }

    #[tokio::test]
    async fn test_index_page_served() {
        let (addr, hub) = spawn_server(4).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("text/html"));
        assert!(response.contains("xterm"));

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_input_echoes_output() {
        let (addr, hub) = spawn_server(4).await;
        let mut ws = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut ws).await, Some(1));

        ws.send(WsMessage::Binary(b"echo binary_path\n".to_vec()))
            .await
            .unwrap();
        assert!(read_until(&mut ws, "binary_path").await);

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_input_and_room_path() {
        let (addr, hub) = spawn_server(4).await;
        let mut ws = connect(addr, "/ws/some-room").await;
        assert_eq!(next_users(&mut ws).await, Some(1));

        ws.send(WsMessage::Text(
            r#"{"type":"input","data":"echo json_path\n"}"#.to_string(),
        ))
        .await
        .unwrap();
        assert!(read_until(&mut ws, "json_path").await);

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_text_is_ignored() {
        let (addr, hub) = spawn_server(4).await;
        let mut ws = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut ws).await, Some(1));

        ws.send(WsMessage::Text("not json".to_string())).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"resize","rows":0,"cols":80}"#.to_string()))
            .await
            .unwrap();

        // The connection survives and still forwards input.
        ws.send(WsMessage::Binary(b"echo still_alive\n".to_vec()))
            .await
            .unwrap();
        assert!(read_until(&mut ws, "still_alive").await);
        assert_eq!(hub.viewer_count().await, 1);

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_message_resizes_session() {
        let (addr, hub) = spawn_server(4).await;
        let mut ws = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut ws).await, Some(1));

        ws.send(WsMessage::Text(r#"{"type":"resize","rows":50,"cols":132}"#.to_string()))
            .await
            .unwrap();

        let mut resized = false;
        for _ in 0..50 {
            if hub.session().size() == TerminalSize::new(50, 132) {
                resized = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(resized);

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_updates_viewer_count() {
        let (addr, hub) = spawn_server(4).await;
        let mut a = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut a).await, Some(1));

        let mut b = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut b).await, Some(2));
        assert_eq!(next_users(&mut a).await, Some(2));

        b.close(None).await.unwrap();
        assert_eq!(next_users(&mut a).await, Some(1));

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let (addr, hub) = spawn_server(1).await;
        let mut first = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut first).await, Some(1));

        let result = connect_async(format!("ws://{}/ws", addr)).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            other => panic!("expected HTTP 503, got {:?}", other.map(|_| ())),
        }

        hub.session().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_end_sends_exit_then_close() {
        let (addr, hub) = spawn_server(4).await;
        let mut ws = connect(addr, "/ws").await;
        assert_eq!(next_users(&mut ws).await, Some(1));

        ws.send(WsMessage::Binary(b"exit 5\n".to_vec())).await.unwrap();

        let mut exit_code = None;
        let mut closed = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(5), ws.next()).await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    if let Ok(ServerMessage::Exit { code }) = ServerMessage::from_json(&text) {
                        exit_code = Some(code);
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        assert_eq!(exit_code, Some(Some(5)));
        assert!(closed);
        assert!(!hub.session().is_running());
    }

    #[tokio::test]
    async fn test_upgrade_refused_after_session_end() {
        let (addr, hub) = spawn_server(4).await;
        hub.session().terminate().await.unwrap();

        let result = connect_async(format!("ws://{}/ws", addr)).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 410);
            }
            other => panic!("expected HTTP 410, got {:?}", other.map(|_| ())),
        }
    }
}
