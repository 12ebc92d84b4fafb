use std::path::{Component, Path};

use crate::UploadError;

/// Validates a client-supplied artifact name.
///
/// The name is joined onto the output directory, so it must stay inside
/// it. Rejects:
/// - Empty names and names with no file component (`.`, `./`)
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_file_name(file_name: &str) -> Result<(), UploadError> {
    let invalid = |reason: String| UploadError::invalid("fileName", reason);

    if file_name.is_empty() {
        return Err(UploadError::missing("fileName"));
    }

    let path = Path::new(file_name);

    if path.is_absolute() {
        return Err(invalid(format!("absolute path not allowed: {file_name}")));
    }

    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(invalid(format!(
                    "parent directory traversal not allowed: {file_name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(invalid(format!("path prefix not allowed: {file_name}")));
            }
            Component::RootDir => {
                return Err(invalid(format!("absolute path not allowed: {file_name}")));
            }
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
        }
    }

    if !has_name || file_name.ends_with('/') || file_name.ends_with('\\') {
        return Err(invalid(format!("no file name in: {file_name}")));
    }

    Ok(())
}
