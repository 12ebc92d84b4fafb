use serde::{Deserialize, Serialize};

use crate::constants::{
    MessageType, WS_ERR_CODE_BAD_GATEWAY, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT,
    WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_NOT_IMPLEMENTED,
    WS_ERR_CODE_TIMEOUT, WS_ERR_CODE_UNPROCESSABLE,
};

/// Stage that produced an error, so clients can pick a corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required request field is missing or invalid.
    Parameter,
    /// A chunk upload carried no payload.
    NoData,
    /// The chunk payload vanished before it could be stored.
    NotFound,
    /// Completion was requested while chunks are still absent.
    MissingChunks,
    /// Another completion for the same session is running.
    Conflict,
    /// Storage or reassembly I/O failed.
    Processing,
    /// Storage I/O exceeded the request timeout; safe to retry.
    Timeout,
    /// The classifier collaborator failed.
    Downstream,
    /// Session id generation failed.
    Entropy,
    /// The message type is not handled by this server.
    UnknownType,
    /// Forward compatibility: unknown kinds deserialize here.
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    /// Numeric code sent alongside the kind.
    pub fn code(self) -> i32 {
        match self {
            Self::Parameter | Self::NoData => WS_ERR_CODE_BAD_REQUEST,
            Self::NotFound => WS_ERR_CODE_NOT_FOUND,
            Self::MissingChunks => WS_ERR_CODE_UNPROCESSABLE,
            Self::Conflict => WS_ERR_CODE_CONFLICT,
            Self::Timeout => WS_ERR_CODE_TIMEOUT,
            Self::Downstream => WS_ERR_CODE_BAD_GATEWAY,
            Self::UnknownType => WS_ERR_CODE_NOT_IMPLEMENTED,
            Self::Processing | Self::Entropy | Self::Unknown => WS_ERR_CODE_INTERNAL,
        }
    }
}

/// Error details in a WebSocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsError {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
    /// Every absent chunk index, ascending. Only set for `missing_chunks`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_chunks: Vec<u64>,
}

/// Envelope for all WebSocket communication.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the handler knows the expected type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code: kind.code(),
                kind,
                message: message.into(),
                missing_chunks: Vec::new(),
            }),
        }
    }

    /// Creates a `missing_chunks` error listing every absent index.
    pub fn missing_chunks(id: impl Into<String>, missing: Vec<u64>) -> Self {
        let mut msg = Self::error(
            id,
            ErrorKind::MissingChunks,
            format!("missing chunks: {missing:?}"),
        );
        if let Some(err) = msg.error.as_mut() {
            err.missing_chunks = missing;
        }
        msg
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::error(&self.id, kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::InitUploadResponse;

    #[test]
    fn message_new_with_payload() {
        let payload = serde_json::json!({"key": "value"});
        let msg = Message::new("msg-1", MessageType::UploadStatus, Some(&payload)).unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.msg_type, MessageType::UploadStatus);
        assert!(msg.payload.is_some());
        assert!(msg.error.is_none());
    }

    #[test]
    fn message_new_without_payload() {
        let msg = Message::new::<()>("msg-2", MessageType::InitUpload, None).unwrap();
        assert!(msg.payload.is_none());
    }

    #[test]
    fn message_error_carries_kind_and_code() {
        let msg = Message::error("msg-3", ErrorKind::Parameter, "missing parameter: sessionId");
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.unwrap();
        assert_eq!(err.code, 400);
        assert_eq!(err.kind, ErrorKind::Parameter);
        assert_eq!(err.message, "missing parameter: sessionId");
        assert!(err.missing_chunks.is_empty());
    }

    #[test]
    fn missing_chunks_error_lists_indices() {
        let msg = Message::missing_chunks("m", vec![1, 4]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"missingChunks\":[1,4]"));
        assert!(json.contains("\"kind\":\"missing_chunks\""));
        assert!(json.contains("\"code\":422"));
    }

    #[test]
    fn message_parse_payload() {
        let resp = InitUploadResponse {
            session_id: "0190a0b0-0000-7000-8000-000000000000".into(),
        };
        let msg = Message::new("m1", MessageType::UploadInitResponse, Some(&resp)).unwrap();
        let parsed: Option<InitUploadResponse> = msg.parse_payload().unwrap();
        assert_eq!(parsed.unwrap(), resp);
    }

    #[test]
    fn message_omits_null_fields() {
        let msg = Message::new::<()>("m1", MessageType::Ping, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn reply_error_preserves_id() {
        let original = Message::new::<()>("req-99", MessageType::CompleteUpload, None).unwrap();
        let reply = original.reply_error(ErrorKind::Conflict, "completion already running");
        assert_eq!(reply.id, "req-99");
        assert_eq!(reply.error.unwrap().code, 409);
    }

    #[test]
    fn unknown_error_kind_deserializes() {
        let json = r#"{"code":418,"kind":"teapot","message":"short and stout"}"#;
        let err: WsError = serde_json::from_str(json).unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }
}
