use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use uuid::Uuid;

use crate::UploadError;

/// Longest session id accepted from a client.
const MAX_SESSION_ID_LEN: usize = 128;

/// Returned when a client-supplied session id cannot be used as a key.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidSessionId(String);

/// Issues a new session id.
///
/// The id is a UUIDv7: the leading 48 bits are the creation time in
/// milliseconds, the rest comes from the OS random source. Fails only when
/// that source does.
pub fn generate_session_id() -> Result<String, UploadError> {
    let mut random = [0u8; 10];
    rand::rngs::OsRng
        .try_fill_bytes(&mut random)
        .map_err(|e| UploadError::Entropy(e.to_string()))?;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| UploadError::Entropy(format!("system clock before epoch: {e}")))?
        .as_millis() as u64;

    let id = uuid::Builder::from_unix_timestamp_millis(millis, &random).into_uuid();
    Ok(id.to_string())
}

/// Checks that a session id is safe to embed in a file name.
///
/// Only ASCII letters, digits and `-` are allowed, which also keeps the
/// `<session>_<index>` chunk key unambiguous.
pub fn validate_session_id(id: &str) -> Result<(), InvalidSessionId> {
    if id.is_empty() {
        return Err(InvalidSessionId("empty session id".into()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(InvalidSessionId(format!(
            "session id longer than {MAX_SESSION_ID_LEN} bytes"
        )));
    }
    if let Some(c) = id.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
        return Err(InvalidSessionId(format!(
            "character {c:?} not allowed in session id"
        )));
    }
    Ok(())
}

/// Creation time embedded in a UUIDv7 session id.
///
/// Returns `None` for ids this server did not issue.
pub fn session_created_at(id: &str) -> Option<SystemTime> {
    let uuid = Uuid::parse_str(id).ok()?;
    if uuid.get_version_num() != 7 {
        return None;
    }
    let b = uuid.as_bytes();
    let millis = u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]);
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}
