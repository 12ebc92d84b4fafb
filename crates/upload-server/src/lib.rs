//! WebSocket server for chunked uploads.
//!
//! Accepts any number of client connections and runs every JSON or binary
//! request on its own task against a shared [`Handler`].

mod binary;
mod connection;
mod handler;
mod server;

pub use binary::{BinaryChunk, BinaryChunkHeader, ParseError, encode_binary_chunk, parse_binary_chunk};
pub use connection::{Connection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};

/// Per-connection send buffer capacity.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Requests one connection may have running at the same time.
pub const MAX_IN_FLIGHT_REQUESTS: usize = 32;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
