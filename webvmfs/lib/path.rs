use crate::{FsError, FsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes a store path into its canonical relative form.
///
/// Leading `/`, empty segments and `.` segments are dropped and backslashes are treated as
/// separators. A trailing `/` is not preserved. `..` segments are rejected because a path must
/// never escape its scope.
///
/// ## Examples
///
/// ```
/// use webvmfs::normalize_path;
///
/// assert_eq!(normalize_path("/public/./index.html").unwrap(), "public/index.html");
/// assert!(normalize_path("../etc/passwd").is_err());
/// ```
pub fn normalize_path(path: &str) -> FsResult<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(FsError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(FsError::InvalidPath(path.to_string()));
    }

    Ok(segments.join("/"))
}

/// Normalizes a path prefix used for listing or bulk deletion.
///
/// Unlike [`normalize_path`], an empty prefix is allowed and addresses the whole scope.
pub fn normalize_prefix(prefix: &str) -> FsResult<String> {
    if prefix.split(['/', '\\']).all(|s| s.is_empty() || s == ".") {
        return Ok(String::new());
    }

    normalize_path(prefix)
}

/// Checks that a scope identifier is usable as a partition key.
pub fn validate_scope(scope: &str) -> FsResult<()> {
    if scope.is_empty() || scope.contains(['/', '\\']) || scope == "." || scope == ".." {
        return Err(FsError::InvalidScope(scope.to_string()));
    }

    Ok(())
}

/// Returns `true` if `path` equals `prefix` or lives underneath it.
pub fn is_under_prefix(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
