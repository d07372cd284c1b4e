//! Well-known virtual paths and file store scopes.

use webvmfs::normalize_path;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The root directory of everything the server provisions inside the virtual machine.
pub const VM_ROOT_DIR: &str = "/opt/supabase";

/// The directory under which each runtime package is extracted.
pub const RUNTIMES_DIR: &str = "/opt/supabase/runtimes";

/// The directory under which each application is deployed.
pub const APPS_DIR: &str = "/opt/supabase/apps";

/// The sub directory of an application holding its static assets.
pub const PUBLIC_SUBDIR: &str = "public";

/// The filename of an application's server log.
pub const SERVER_LOG_FILENAME: &str = "server.log";

/// The filename of an application's server PID file.
pub const SERVER_PID_FILENAME: &str = "server.pid";

/// The filename the raw runtime bundle is staged under, inside the runtime root.
pub const BUNDLE_FILENAME: &str = ".bundle.tar";

/// The prefix of file store scopes that hold runtime packages.
pub const RUNTIME_SCOPE_PREFIX: &str = "runtime:";

/// The prefix of file store scopes that hold applications.
pub const APP_SCOPE_PREFIX: &str = "app:";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the virtual root directory of a runtime package.
pub fn runtime_root(id: &str) -> String {
    format!("{RUNTIMES_DIR}/{id}")
}

/// Returns the virtual path the raw bundle of a runtime package is staged at.
pub fn runtime_bundle_path(id: &str) -> String {
    format!("{RUNTIMES_DIR}/{id}/{BUNDLE_FILENAME}")
}

/// Returns the virtual root directory of an application.
pub fn app_root(id: &str) -> String {
    format!("{APPS_DIR}/{id}")
}

/// Returns the virtual directory holding an application's static assets.
pub fn app_public_dir(id: &str) -> String {
    format!("{APPS_DIR}/{id}/{PUBLIC_SUBDIR}")
}

/// Returns the virtual path of an application's PID file.
pub fn app_pid_file(id: &str) -> String {
    format!("{APPS_DIR}/{id}/{SERVER_PID_FILENAME}")
}

/// Returns the virtual path of an application's server log.
pub fn app_log_file(id: &str) -> String {
    format!("{APPS_DIR}/{id}/{SERVER_LOG_FILENAME}")
}

/// Returns the file store scope of a runtime package.
pub fn runtime_scope(id: &str) -> String {
    format!("{RUNTIME_SCOPE_PREFIX}{id}")
}

/// Returns the file store scope of an application.
pub fn app_scope(id: &str) -> String {
    format!("{APP_SCOPE_PREFIX}{id}")
}

/// Maps a virtual path under a runtime or application root onto its `(scope, relative path)`.
///
/// The relative path is empty when `path` addresses the root itself. Paths outside the
/// well-known roots yield `None`.
///
/// ## Examples
///
/// ```
/// use webvm::utils::scope_for_virtual_path;
///
/// assert_eq!(
///     scope_for_virtual_path("/opt/supabase/runtimes/nginx/bin/nginx"),
///     Some(("runtime:nginx".to_string(), "bin/nginx".to_string()))
/// );
/// assert_eq!(scope_for_virtual_path("/etc/hosts"), None);
/// ```
pub fn scope_for_virtual_path(path: &str) -> Option<(String, String)> {
    let (rest, prefix) = if let Some(rest) = path.strip_prefix(RUNTIMES_DIR) {
        (rest, RUNTIME_SCOPE_PREFIX)
    } else if let Some(rest) = path.strip_prefix(APPS_DIR) {
        (rest, APP_SCOPE_PREFIX)
    } else {
        return None;
    };

    let rest = rest.strip_prefix('/')?;
    let (id, relative) = match rest.split_once('/') {
        Some((id, relative)) => (id, relative.trim_end_matches('/')),
        None => (rest, ""),
    };

    if id.is_empty() {
        return None;
    }

    Some((format!("{prefix}{id}"), relative.to_string()))
}

/// Sanitizes an archive entry or upload path into a path relative to its root.
///
/// Returns `None` for paths that are empty or try to escape their root.
pub fn sanitize_relative_path(path: &str) -> Option<String> {
    normalize_path(path).ok()
}

/// Returns the files a static server tries for a request path, in order.
///
/// Directory-style paths map to their `index.html`; other paths are tried as-is and then as a
/// directory.
pub fn static_file_candidates(request_path: &str) -> Vec<String> {
    let path = request_path.trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        vec![format!("{path}index.html")]
    } else {
        vec![path.to_string(), format!("{path}/index.html")]
    }
}

/// Returns `true` if a relative path should be marked executable after extraction.
pub fn is_executable_path(relative: &str) -> bool {
    relative.starts_with("bin/") || relative.contains("/bin/") || relative.ends_with(".sh")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_paths() {
        assert_eq!(runtime_root("nginx"), "/opt/supabase/runtimes/nginx");
        assert_eq!(
            runtime_bundle_path("nginx"),
            "/opt/supabase/runtimes/nginx/.bundle.tar"
        );
        assert_eq!(app_public_dir("blog"), "/opt/supabase/apps/blog/public");
        assert_eq!(app_pid_file("blog"), "/opt/supabase/apps/blog/server.pid");
        assert_eq!(app_log_file("blog"), "/opt/supabase/apps/blog/server.log");
    }

    #[test]
    fn test_scope_for_virtual_path() {
        assert_eq!(
            scope_for_virtual_path("/opt/supabase/apps/blog/public/index.html"),
            Some(("app:blog".to_string(), "public/index.html".to_string()))
        );
        assert_eq!(
            scope_for_virtual_path("/opt/supabase/runtimes/nginx"),
            Some(("runtime:nginx".to_string(), String::new()))
        );
        assert_eq!(
            scope_for_virtual_path("/opt/supabase/runtimes/nginx/"),
            Some(("runtime:nginx".to_string(), String::new()))
        );
        assert_eq!(scope_for_virtual_path("/opt/supabase/runtimes"), None);
        assert_eq!(scope_for_virtual_path("/opt/supabase/runtimesx/a"), None);
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(
            sanitize_relative_path("./bin/start.sh").as_deref(),
            Some("bin/start.sh")
        );
        assert_eq!(sanitize_relative_path("../../etc/passwd"), None);
        assert_eq!(sanitize_relative_path("/"), None);
    }

    #[test]
    fn test_static_file_candidates() {
        assert_eq!(static_file_candidates("/"), vec!["index.html"]);
        assert_eq!(static_file_candidates("/docs/"), vec!["docs/index.html"]);
        assert_eq!(
            static_file_candidates("/about"),
            vec!["about", "about/index.html"]
        );
    }

    #[test]
    fn test_is_executable_path() {
        assert!(is_executable_path("bin/start.sh"));
        assert!(is_executable_path("bin/node"));
        assert!(is_executable_path("lib/node/bin/npm"));
        assert!(is_executable_path("scripts/setup.sh"));
        assert!(!is_executable_path("README.md"));
    }
}
