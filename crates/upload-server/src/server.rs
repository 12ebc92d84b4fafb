//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades each accepted connection to WebSocket,
//! and serves every client on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use cropscan_protocol::constants::{DEFAULT_PORT, WS_MAX_MESSAGE_SIZE};

use crate::ServerError;
use crate::connection;
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// The upload WebSocket server.
///
/// Serves any number of concurrent clients and dispatches their messages
/// to the shared [`Handler`].
pub struct UploadServer<H: Handler> {
    port: u16,
    handler: Arc<H>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: AtomicUsize,
}

impl<H: Handler> UploadServer<H> {
    /// Creates a new server with the given handler.
    ///
    /// Cancelling `cancel` (or calling [`shutdown`](Self::shutdown)) stops
    /// the accept loop and closes every open connection.
    pub fn new(config: ServerConfig, handler: H, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            handler: Arc::new(handler),
            cancel,
            local_addr: Mutex::new(None),
            connections: AtomicUsize::new(0),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of clients currently connected.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: upgrades to WS and serves it until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let open = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(%peer_addr, open, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            peer_addr.to_string(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        conn.closed().await;

        self.connections.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{BinaryChunk, BinaryChunkHeader, encode_binary_chunk};
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use cropscan_protocol::envelope::{ErrorKind, Message};
    use cropscan_protocol::MessageType;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Answers every request at once, except completions, which wait until
    /// the test opens `gate`.
    #[derive(Default)]
    struct TestHandler {
        gate: Notify,
    }

    fn answer(sender: &Sender, msg: &Message, msg_type: MessageType, body: serde_json::Value) {
        if let Ok(reply) = msg.reply(msg_type, Some(&body)) {
            let _ = sender.send_msg(reply);
        }
    }

    impl Handler for TestHandler {
        fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                answer(&sender, &msg, MessageType::UploadInitResponse, serde_json::json!({ "sessionId": "S" }));
            })
        }

        fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                answer(&sender, &msg, MessageType::UploadChunkResponse, serde_json::json!({}));
            })
        }

        fn on_binary_chunk(&self, sender: Sender, chunk: BinaryChunk) -> HandlerFuture<'_> {
            Box::pin(async move {
                let payload = serde_json::json!({ "size": chunk.data.len() });
                if let Ok(reply) = Message::new(
                    chunk.header.id,
                    MessageType::UploadChunkResponse,
                    Some(&payload),
                ) {
                    let _ = sender.send_msg(reply);
                }
            })
        }

        fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.gate.notified().await;
                answer(&sender, &msg, MessageType::UploadCompleteResponse, serde_json::json!({}));
            })
        }

        fn on_upload_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                answer(&sender, &msg, MessageType::UploadStatusResponse, serde_json::json!({}));
            })
        }
    }

    async fn start() -> (Arc<UploadServer<TestHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = UploadServer::new(
            ServerConfig { port: 0 },
            TestHandler::default(),
            CancellationToken::new(),
        );
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "should have bound to a dynamic port");
        (server, handle, format!("ws://127.0.0.1:{port}"))
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for reply")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn default_config_uses_default_port() {
        assert_eq!(ServerConfig::default().port, 3000);
    }

    #[tokio::test]
    async fn serves_concurrent_clients() {
        let (server, handle, url) = start().await;

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 2);

        for (ws, id) in [(&mut a, "a-1"), (&mut b, "b-1")] {
            let ping = serde_json::json!({ "id": id, "type": "ping" });
            ws.send(WsMessage::Text(ping.to_string().into())).await.unwrap();
            let reply = next_message(ws).await;
            assert_eq!(reply.id, id);
            assert_eq!(reply.msg_type, MessageType::Pong);
        }

        drop(a);
        drop(b);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_type_gets_501() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({ "id": "x-1", "type": "launch_rocket" });
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();

        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "x-1");
        let err = reply.error.unwrap();
        assert_eq!(err.kind, ErrorKind::UnknownType);
        assert_eq!(err.code, 501);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn routes_each_operation() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        for (id, msg_type, expected) in [
            ("i-1", "init_upload", MessageType::UploadInitResponse),
            ("c-1", "upload_chunk", MessageType::UploadChunkResponse),
            ("s-1", "upload_status", MessageType::UploadStatusResponse),
        ] {
            let msg = serde_json::json!({ "id": id, "type": msg_type });
            ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
            let reply = next_message(&mut ws).await;
            assert_eq!(reply.id, id);
            assert_eq!(reply.msg_type, expected);
        }

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_request_does_not_hold_up_the_connection() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let complete = serde_json::json!({ "id": "done-1", "type": "complete_upload" });
        ws.send(WsMessage::Text(complete.to_string().into())).await.unwrap();

        // The completion is parked; chunks and pings sent after it still
        // get their replies first.
        for i in 0..3 {
            let chunk = serde_json::json!({ "id": format!("chunk-{i}"), "type": "upload_chunk" });
            ws.send(WsMessage::Text(chunk.to_string().into())).await.unwrap();
            let reply = next_message(&mut ws).await;
            assert_eq!(reply.id, format!("chunk-{i}"));
        }
        let ping = serde_json::json!({ "id": "p-1", "type": "ping" });
        ws.send(WsMessage::Text(ping.to_string().into())).await.unwrap();
        assert_eq!(next_message(&mut ws).await.msg_type, MessageType::Pong);

        server.handler().gate.notify_one();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "done-1");
        assert_eq!(reply.msg_type, MessageType::UploadCompleteResponse);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_json_gets_parameter_error() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(WsMessage::Text("{not json".into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Parameter);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_binary_chunks() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let header = BinaryChunkHeader {
            id: "bin-1".into(),
            session_id: Some("S".into()),
            chunk_index: Some(0),
            total_chunks: Some(1),
            ..Default::default()
        };
        let frame = encode_binary_chunk(&header, b"12345").unwrap();
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();

        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "bin-1");
        let payload: serde_json::Value = reply.parse_payload().unwrap().unwrap();
        assert_eq!(payload["size"], 5);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        handle.await.unwrap();

        // The client sees the close frame or the end of the stream.
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }
}
