//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework
//! handles connection management, routing, and the binary protocol.

use std::future::Future;
use std::pin::Pin;

use cropscan_protocol::MessageType;
use cropscan_protocol::envelope::Message;

use crate::binary::BinaryChunk;
use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from upload clients.
///
/// Each request arrives on its own task with a [`Sender`] for the reply,
/// so implementations may take as long as they need without holding up
/// other requests on the same connection.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for `upload_chunk` with a base64 payload.
    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for a chunk sent as a binary frame.
    fn on_binary_chunk(&self, sender: Sender, chunk: BinaryChunk) -> HandlerFuture<'_>;

    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    fn on_upload_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called once when a client disconnects.
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
