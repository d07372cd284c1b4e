//! Shell command lines issued inside the virtual machine.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the shell line that starts a static file server in the background and records its
/// PID.
pub fn start_static_server_command(
    port: u16,
    public_dir: &str,
    log_file: &str,
    pid_file: &str,
) -> String {
    format!(
        "nohup python3 -m http.server {port} --directory {public_dir} > {log_file} 2>&1 & echo $! > {pid_file}"
    )
}

/// Returns the shell line that stops the server recorded in `pid_file`.
pub fn stop_static_server_command(pid_file: &str) -> String {
    format!("kill $(cat {pid_file}) 2>/dev/null || true")
}

/// Returns the `sh -c` arguments running `script`.
pub fn shell_args(script: impl Into<String>) -> Vec<String> {
    vec!["-c".to_string(), script.into()]
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
