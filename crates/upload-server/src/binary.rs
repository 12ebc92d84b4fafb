//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.

use cropscan_protocol::messages::UploadChunkRequest;
use serde::{Deserialize, Serialize};

/// Header of a binary upload chunk.
///
/// Carries the same fields as a JSON `upload_chunk` request; the payload
/// follows the header instead of being base64-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// A parsed binary frame.
#[derive(Debug)]
pub struct BinaryChunk {
    pub header: BinaryChunkHeader,
    pub data: Vec<u8>,
}

impl BinaryChunk {
    /// Converts the frame into the equivalent JSON request payload.
    pub fn into_request(self) -> (String, UploadChunkRequest) {
        let BinaryChunk { header, data } = self;
        let req = UploadChunkRequest {
            session_id: header.session_id,
            chunk_index: header.chunk_index,
            total_chunks: header.total_chunks,
            file_name: header.file_name,
            checksum: header.checksum,
            data: Some(data),
        };
        (header.id, req)
    }
}

/// Parses a raw binary WebSocket frame.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_binary_chunk(data: &[u8]) -> Result<BinaryChunk, ParseError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(ParseError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: BinaryChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    Ok(BinaryChunk {
        header,
        data: payload.to_vec(),
    })
}

/// Encodes a binary chunk frame for sending over WebSocket.
pub fn encode_binary_chunk(
    header: &BinaryChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
