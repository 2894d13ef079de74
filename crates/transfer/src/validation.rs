use std::path::{Component, Path};

use crate::TransferError;

/// Longest file name accepted, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Validates a client-supplied file name.
///
/// The name must be a single plain path component. Rejects:
/// - Empty names and names longer than 255 bytes
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - Any `/` or `\` separator
/// - `.` and `..`
/// - Control characters
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(
            "control characters not allowed".into(),
        ));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) => Err(TransferError::InvalidName(format!(
            "parent directory not allowed: {name}"
        ))),
        _ => Err(TransferError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
