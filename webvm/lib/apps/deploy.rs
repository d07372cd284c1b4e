use std::collections::BTreeSet;

use bytes::Bytes;

use crate::{Application, WebVmError, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest accepted application name.
pub const MAX_APP_NAME_LEN: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file of a static application, addressed relative to its public directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    /// The path relative to the public directory.
    pub path: String,

    /// The file contents.
    pub data: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StaticFile {
    /// Creates a file.
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates an application name: non-empty, at most [`MAX_APP_NAME_LEN`] characters, made of
/// ASCII letters, digits, spaces, `.`, `_` and `-`.
pub fn validate_app_name(name: &str) -> WebVmResult<()> {
    if name.trim().is_empty() {
        return Err(WebVmError::Validation(
            "application name cannot be empty".into(),
        ));
    }

    if name.chars().count() > MAX_APP_NAME_LEN {
        return Err(WebVmError::Validation(format!(
            "application name is longer than {MAX_APP_NAME_LEN} characters"
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-')))
    {
        return Err(WebVmError::Validation(format!(
            "application name contains invalid character {c:?}"
        )));
    }

    Ok(())
}

/// Returns the lowest port at or above `base` not held by any of `applications`.
///
/// Ports are kept across restarts, so stopped applications still hold theirs.
pub fn allocate_port(applications: &[Application], base: u16) -> WebVmResult<u16> {
    let used: BTreeSet<u16> = applications.iter().filter_map(|a| a.port).collect();

    let mut port = base;
    while used.contains(&port) {
        port = port
            .checked_add(1)
            .ok_or_else(|| WebVmError::Conflict(format!("no free port at or above {base}")))?;
    }

    Ok(port)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
