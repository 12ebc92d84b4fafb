//! One client connection: a writer draining the outbound queue, and a
//! reader that decodes frames and serves each request on its own task.

use std::sync::Arc;

use cropscan_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use cropscan_protocol::envelope::{ErrorKind, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::binary::{BinaryChunk, parse_binary_chunk};
use crate::handler::Handler;
use crate::{MAX_IN_FLIGHT_REQUESTS, SEND_BUFFER_SIZE};

/// Handle for sending messages to one connected client.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is full or closed.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, kind: ErrorKind, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(kind, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active client connection.
///
/// Owns the reader task, which in turn owns every request task of the
/// connection, and hands out [`Sender`]s for replies.
pub struct Connection {
    pub peer: String,
    sender: Sender,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Stops reading, writing and every in-flight request.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits until the reader and the disconnect hook have finished.
    pub async fn closed(self) {
        if let Err(e) = self.reader.await {
            tracing::error!(peer = %self.peer, "connection reader failed: {e}");
        }
    }
}

/// Starts serving a WebSocket connection.
///
/// The returned [`Connection`] ends when the peer goes away, goes silent
/// for longer than [`WS_PONG_WAIT`], or `server_cancel` fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    peer: String,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> Connection
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };
    let (sink, stream) = ws_stream.split();

    tokio::spawn(write_loop(sink, rx, cancel.clone()));

    let reader = tokio::spawn({
        let sender = sender.clone();
        let cancel = cancel.clone();
        let peer = peer.clone();
        async move {
            read_loop(stream, sender, Arc::clone(&handler), cancel.clone()).await;
            cancel.cancel();
            handler.on_disconnected().await;
            tracing::info!(peer = %peer, "client disconnected");
        }
    });

    Connection {
        peer,
        sender,
        cancel,
        reader,
    }
}

/// Sends queued replies and a keepalive ping every [`WS_PING_PERIOD`].
async fn write_loop<S>(mut sink: S, mut outbound: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: Sink<WsMessage, Error = WsError> + Send + Unpin,
{
    let mut keepalive = tokio::time::interval(WS_PING_PERIOD);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            queued = outbound.recv() => match queued {
                Some(frame) => frame,
                None => break,
            },
            _ = keepalive.tick() => WsMessage::Ping(Default::default()),
        };
        if let Err(e) = sink.send(frame).await {
            tracing::error!("websocket write failed: {e}");
            break;
        }
    }

    let _ = sink.close().await;
}

/// An inbound request, decoded and ready for the [`Handler`].
enum Request {
    Message(Message),
    Chunk(BinaryChunk),
}

/// Reads frames until the connection ends.
///
/// Every request runs on its own task, so a long completion never holds up
/// chunk uploads or liveness tracking on the same connection. At most
/// [`MAX_IN_FLIGHT_REQUESTS`] run at once; beyond that the reader stops
/// pulling frames until one finishes. Requests still running when the
/// connection ends are dropped with it.
async fn read_loop<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Send + Unpin,
    H: Handler,
{
    let mut in_flight = JoinSet::new();
    let silence = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(silence);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut silence => {
                tracing::warn!("no traffic for {WS_PONG_WAIT:?}, closing connection");
                break;
            }

            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        tracing::error!("request task panicked: {e}");
                    }
                }
            }

            frame = stream.next(), if in_flight.len() < MAX_IN_FLIGHT_REQUESTS => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::error!("websocket read failed: {e}");
                        break;
                    }
                    None => break,
                };
                // Pongs and requests alike prove the peer is alive.
                silence.as_mut().reset(Instant::now() + WS_PONG_WAIT);

                let request = match frame {
                    WsMessage::Text(text) => decode_text(&text, &sender),
                    WsMessage::Binary(data) => decode_binary(&data, &sender),
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                        None
                    }
                    WsMessage::Close(_) => {
                        tracing::debug!("received close frame");
                        break;
                    }
                    WsMessage::Pong(_) | WsMessage::Frame(_) => None,
                };
                if let Some(request) = request {
                    let handler = Arc::clone(&handler);
                    let sender = sender.clone();
                    in_flight.spawn(async move { serve(handler.as_ref(), sender, request).await });
                }
            }
        }
    }

    in_flight.shutdown().await;
}

/// Parses a JSON envelope, answering malformed ones directly.
fn decode_text(text: &str, sender: &Sender) -> Option<Request> {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        tracing::error!(size = text.len(), "text message over {WS_MAX_MESSAGE_SIZE} bytes dropped");
        return None;
    }
    match serde_json::from_str(text) {
        Ok(msg) => Some(Request::Message(msg)),
        Err(e) => {
            tracing::warn!("invalid message JSON: {e}");
            let reply = Message::error("", ErrorKind::Parameter, format!("invalid message JSON: {e}"));
            let _ = sender.send_msg(reply);
            None
        }
    }
}

/// Parses a binary chunk frame, answering malformed ones directly.
fn decode_binary(data: &[u8], sender: &Sender) -> Option<Request> {
    if data.len() > WS_MAX_MESSAGE_SIZE {
        tracing::error!(size = data.len(), "binary message over {WS_MAX_MESSAGE_SIZE} bytes dropped");
        return None;
    }
    match parse_binary_chunk(data) {
        Ok(chunk) => Some(Request::Chunk(chunk)),
        Err(e) => {
            tracing::warn!("invalid binary frame: {e}");
            let reply = Message::error("", ErrorKind::Parameter, format!("invalid binary frame: {e}"));
            let _ = sender.send_msg(reply);
            None
        }
    }
}

/// Routes one request to the matching handler method.
async fn serve<H: Handler>(handler: &H, sender: Sender, request: Request) {
    let msg = match request {
        Request::Chunk(chunk) => return handler.on_binary_chunk(sender, chunk).await,
        Request::Message(msg) => msg,
    };
    match msg.msg_type {
        MessageType::Ping => handler.on_ping(sender, msg).await,
        MessageType::InitUpload => handler.on_init_upload(sender, msg).await,
        MessageType::UploadChunk => handler.on_upload_chunk(sender, msg).await,
        MessageType::CompleteUpload => handler.on_complete_upload(sender, msg).await,
        MessageType::UploadStatus => handler.on_upload_status(sender, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, ErrorKind::UnknownType, "unknown message type");
        }
    }
}
