use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port for the upload server.
pub const DEFAULT_PORT: u16 = 3000;

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// the connection is considered dead. Set high enough to tolerate slow
/// clients pausing between chunks.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings connected clients.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "init_upload")]
    InitUpload,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "complete_upload")]
    CompleteUpload,
    #[serde(rename = "upload_status")]
    UploadStatus,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "upload_init_response")]
    UploadInitResponse,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "upload_complete_response")]
    UploadCompleteResponse,
    #[serde(rename = "upload_status_response")]
    UploadStatusResponse,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_BAD_GATEWAY: i32 = 502;
pub const WS_ERR_CODE_TIMEOUT: i32 = 504;
