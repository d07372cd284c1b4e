use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, LazyLock,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Method, StatusCode, Url,
};
use tokio::sync::RwLock;
use webvmfs::ScopedFileStore;

use crate::{
    archive::parse_tar,
    utils::{content_type_for, scope_for_virtual_path, static_file_candidates},
    WebVmError, WebVmResult,
};

use super::{command_line, Capabilities, ExecOutput, VmHandle, VmRequest, VmResponse};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The first PID handed out to emulated processes.
const FIRST_EMULATED_PID: u32 = 1000;

/// The exit code of commands outside the emulated whitelist.
const COMMAND_NOT_FOUND: i32 = 127;

static START_SERVER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^nohup python3 -m http\.server (\d+) --directory (\S+) > (\S+) 2>&1 & echo \$! > (\S+)$",
    )
    .ok()
});

static STOP_SERVER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^kill \$\(cat (\S+)\)").ok());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A virtual machine emulated on top of a [`ScopedFileStore`].
///
/// Files written under the runtime and application roots land in the store. `exec` understands
/// the handful of commands the installer and the static server process model issue, and `fetch`
/// serves static files for the ports of emulated servers.
pub struct EmulatedVm {
    files: Arc<dyn ScopedFileStore>,
    processes: RwLock<HashMap<u16, EmulatedProcess>>,
    next_pid: AtomicU32,
}

/// A static file server started through the emulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedProcess {
    /// The emulated PID.
    pub pid: u32,

    /// The port the server listens on.
    pub port: u16,

    /// The file store scope files are served from.
    pub scope: String,

    /// The directory within the scope files are served from.
    pub directory: String,

    /// The virtual PID file.
    pub pid_file: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EmulatedVm {
    /// Creates an emulation backed by `files`.
    pub fn new(files: Arc<dyn ScopedFileStore>) -> Self {
        Self {
            files,
            processes: RwLock::new(HashMap::new()),
            next_pid: AtomicU32::new(FIRST_EMULATED_PID),
        }
    }

    /// Returns the emulated server listening on `port`.
    pub async fn process(&self, port: u16) -> Option<EmulatedProcess> {
        self.processes.read().await.get(&port).cloned()
    }

    /// Returns the ports of all emulated servers, sorted.
    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.processes.read().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    async fn remove_tree(&self, path: &str) -> WebVmResult<usize> {
        let Some((scope, relative)) = scope_for_virtual_path(path) else {
            return Ok(0);
        };

        let removed = if relative.is_empty() {
            self.files.clear_scope(&scope).await?
        } else {
            self.files.delete_prefix(&scope, &relative).await?
        };
        Ok(removed)
    }

    async fn extract(&self, bundle: &str, destination: &str) -> WebVmResult<usize> {
        let (bundle_scope, bundle_path) = scoped(bundle)?;
        let archive = self.files.read(&bundle_scope, &bundle_path).await?;
        let (scope, root) = scope_for_virtual_path(destination).ok_or_else(|| {
            WebVmError::Validation(format!("cannot extract outside known roots: {destination}"))
        })?;

        let mut written = 0;
        for entry in parse_tar(archive.get_data())?.into_iter().filter(|e| e.is_file()) {
            let Ok(relative) = webvmfs::normalize_path(&entry.name) else {
                continue;
            };
            let path = if root.is_empty() {
                relative
            } else {
                format!("{root}/{relative}")
            };
            self.files.write(&scope, &path, entry.data).await?;
            written += 1;
        }

        Ok(written)
    }

    async fn start_server(&self, captures: &regex::Captures<'_>) -> WebVmResult<ExecOutput> {
        let port: u16 = captures[1]
            .parse()
            .map_err(|_| WebVmError::Validation(format!("invalid port {}", &captures[1])))?;
        let (scope, directory) = scope_for_virtual_path(&captures[2]).ok_or_else(|| {
            WebVmError::Validation(format!("cannot serve outside known roots: {}", &captures[2]))
        })?;
        let log_file = &captures[3];
        let pid_file = captures[4].to_string();

        let mut processes = self.processes.write().await;
        if processes.contains_key(&port) {
            return Ok(ExecOutput::failed(
                1,
                format!("port {port} is already in use"),
            ));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        if let Ok((pid_scope, pid_path)) = scoped(&pid_file) {
            self.files
                .write(&pid_scope, &pid_path, Bytes::from(pid.to_string()))
                .await?;
        }
        if let Ok((log_scope, log_path)) = scoped(log_file) {
            let line = format!("Serving HTTP on 0.0.0.0 port {port}\n");
            self.files
                .write(&log_scope, &log_path, Bytes::from(line))
                .await?;
        }

        tracing::debug!("emulated static server {pid} listening on port {port}");
        processes.insert(
            port,
            EmulatedProcess {
                pid,
                port,
                scope,
                directory,
                pid_file,
            },
        );

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stop_server(&self, pid_file: &str) -> WebVmResult<ExecOutput> {
        let mut processes = self.processes.write().await;
        let port = processes
            .iter()
            .find(|(_, process)| process.pid_file == pid_file)
            .map(|(port, _)| *port);

        let Some(port) = port else {
            tracing::debug!("no emulated static server for {pid_file}, nothing to stop");
            return Ok(ExecOutput::ok());
        };

        processes.remove(&port);
        if let Ok((scope, path)) = scoped(pid_file) {
            self.files.delete(&scope, &path).await?;
        }

        tracing::debug!("emulated static server on port {port} stopped");
        Ok(ExecOutput::ok())
    }

    async fn shell(&self, script: &str) -> WebVmResult<ExecOutput> {
        let script = script.trim();

        if let Some(captures) = START_SERVER.as_ref().and_then(|re| re.captures(script)) {
            return self.start_server(&captures).await;
        }

        if let Some(captures) = STOP_SERVER.as_ref().and_then(|re| re.captures(script)) {
            return self.stop_server(&captures[1]).await;
        }

        Ok(ExecOutput::failed(
            COMMAND_NOT_FOUND,
            format!("sh: not supported in emulation: {script}"),
        ))
    }

    async fn serve(&self, request: &VmRequest) -> WebVmResult<VmResponse> {
        let url = match Url::parse(&request.url) {
            Ok(url) if url.scheme() == "http" && is_loopback(&url) => url,
            _ => {
                return Ok(VmResponse::new(
                    StatusCode::NOT_IMPLEMENTED,
                    "unsupported request target",
                ))
            }
        };

        let process = match url.port() {
            Some(port) => self.process(port).await,
            None => None,
        };
        let Some(process) = process else {
            return Ok(VmResponse::new(StatusCode::BAD_GATEWAY, "no server on port"));
        };

        for candidate in static_file_candidates(url.path()) {
            let full = if process.directory.is_empty() {
                candidate
            } else {
                format!("{}/{candidate}", process.directory)
            };

            match self.files.read(&process.scope, &full).await {
                Ok(file) => {
                    let mut response = VmResponse::new(
                        StatusCode::OK,
                        if request.method == Method::HEAD {
                            Bytes::new()
                        } else {
                            file.get_data().clone()
                        },
                    );
                    response.headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(content_type_for(&full)),
                    );
                    return Ok(response);
                }
                Err(e) if e.is_not_found() => continue,
                Err(webvmfs::FsError::InvalidPath(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(VmResponse::new(StatusCode::NOT_FOUND, "not found"))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl VmHandle for EmulatedVm {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            write_file: true,
            exec: true,
            fetch: true,
            ..Default::default()
        }
    }

    async fn write_file(&self, path: &str, data: Bytes) -> WebVmResult<()> {
        let (scope, relative) = scoped(path)?;
        self.files.write(&scope, &relative, data).await?;
        Ok(())
    }

    async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
        tracing::trace!("emulating `{}`", command_line(command, args));
        let flags: Vec<&str> = args.iter().map(String::as_str).collect();

        match (command, flags.as_slice()) {
            ("mkdir" | "chmod" | "systemctl", _) => Ok(ExecOutput::ok()),
            ("rm", [flag, paths @ ..]) if flag.starts_with('-') && flag.contains('r') => {
                for path in paths {
                    self.remove_tree(path).await?;
                }
                Ok(ExecOutput::ok())
            }
            ("tar", _) => match tar_operands(&flags) {
                Some((bundle, destination)) => match self.extract(bundle, destination).await {
                    Ok(written) => Ok(ExecOutput {
                        exit_code: 0,
                        stdout: format!("{written} file(s) extracted"),
                        stderr: String::new(),
                    }),
                    Err(e) => Ok(ExecOutput::failed(2, format!("tar: {e}"))),
                },
                None => Ok(ExecOutput::failed(2, "tar: only -xf <file> -C <dir> is emulated")),
            },
            ("sh", ["-c", script]) => self.shell(script).await,
            _ => Ok(ExecOutput::failed(
                COMMAND_NOT_FOUND,
                format!("{command}: not supported in emulation"),
            )),
        }
    }

    async fn fetch(&self, request: VmRequest) -> WebVmResult<VmResponse> {
        self.serve(&request).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Maps a virtual file path onto its store key, rejecting paths outside known roots.
fn scoped(path: &str) -> WebVmResult<(String, String)> {
    match scope_for_virtual_path(path) {
        Some((scope, relative)) if !relative.is_empty() => Ok((scope, relative)),
        _ => Err(WebVmError::Validation(format!(
            "path is outside the emulated filesystem: {path}"
        ))),
    }
}

/// Extracts `<bundle>` and `<dir>` from `-xf <bundle> -C <dir>` in any order.
fn tar_operands<'a>(args: &[&'a str]) -> Option<(&'a str, &'a str)> {
    let mut bundle = None;
    let mut destination = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "-xf" | "xf" | "-xvf" => bundle = iter.next().copied(),
            "-C" => destination = iter.next().copied(),
            _ => {}
        }
    }

    Some((bundle?, destination?))
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1" | "localhost"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use webvmfs::MemoryFileStore;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn start_script(port: u16) -> String {
        format!(
            "nohup python3 -m http.server {port} --directory /opt/supabase/apps/blog/public > /opt/supabase/apps/blog/server.log 2>&1 & echo $! > /opt/supabase/apps/blog/server.pid"
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_emulator_writes_into_scopes() -> anyhow::Result<()> {
        let files = Arc::new(MemoryFileStore::new());
        let vm = EmulatedVm::new(files.clone());

        vm.write_file(
            "/opt/supabase/runtimes/nginx/bin/nginx",
            Bytes::from_static(b"elf"),
        )
        .await?;
        assert!(files.exists("runtime:nginx", "bin/nginx").await?);

        assert!(vm
            .write_file("/etc/passwd", Bytes::from_static(b"x"))
            .await
            .is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_emulator_exec_whitelist() -> anyhow::Result<()> {
        let files = Arc::new(MemoryFileStore::new());
        let vm = EmulatedVm::new(files.clone());
        files
            .write("runtime:nginx", "bin/nginx", Bytes::from_static(b"elf"))
            .await?;

        assert!(vm.exec("mkdir", &["-p".into(), "/opt/x".into()]).await?.success());
        assert!(vm.exec("chmod", &["+x".into(), "/opt/x".into()]).await?.success());
        assert!(vm
            .exec("systemctl", &["enable".into(), "nginx".into()])
            .await?
            .success());
        assert_eq!(vm.exec("curl", &[]).await?.exit_code, COMMAND_NOT_FOUND);
        assert_eq!(
            vm.exec("sh", &sh("echo hi")).await?.exit_code,
            COMMAND_NOT_FOUND
        );

        vm.exec(
            "rm",
            &["-rf".into(), "/opt/supabase/runtimes/nginx".into()],
        )
        .await?;
        assert!(!files.exists("runtime:nginx", "bin/nginx").await?);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_emulator_serves_static_files() -> anyhow::Result<()> {
        let files = Arc::new(MemoryFileStore::new());
        let vm = EmulatedVm::new(files.clone());
        files
            .write("app:blog", "public/index.html", Bytes::from_static(b"<h1>hi</h1>"))
            .await?;
        files
            .write("app:blog", "public/css/site.css", Bytes::from_static(b"body{}"))
            .await?;

        assert!(vm.exec("sh", &sh(&start_script(8080))).await?.success());
        assert_eq!(vm.ports().await, vec![8080]);
        assert!(files.exists("app:blog", "server.pid").await?);

        let index = vm.fetch(VmRequest::get("http://127.0.0.1:8080/")).await?;
        assert_eq!(index.status, StatusCode::OK);
        assert_eq!(&index.body[..], b"<h1>hi</h1>");
        assert_eq!(index.headers[CONTENT_TYPE], "text/html; charset=utf-8");

        let css = vm
            .fetch(VmRequest::get("http://127.0.0.1:8080/css/site.css"))
            .await?;
        assert_eq!(&css.body[..], b"body{}");

        let missing = vm.fetch(VmRequest::get("http://127.0.0.1:8080/nope")).await?;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let unknown_port = vm.fetch(VmRequest::get("http://127.0.0.1:9999/")).await?;
        assert_eq!(unknown_port.status, StatusCode::BAD_GATEWAY);

        let remote = vm.fetch(VmRequest::get("https://example.com/")).await?;
        assert_eq!(remote.status, StatusCode::NOT_IMPLEMENTED);

        let stop = "kill $(cat /opt/supabase/apps/blog/server.pid) 2>/dev/null || true";
        assert!(vm.exec("sh", &sh(stop)).await?.success());
        assert!(vm.ports().await.is_empty());
        assert!(!files.exists("app:blog", "server.pid").await?);

        // Stopping again matches `|| true` on a real machine.
        assert!(vm.exec("sh", &sh(stop)).await?.success());

        Ok(())
    }

    #[test]
    fn test_tar_operands() {
        assert_eq!(
            tar_operands(&["-xf", "/a.tar", "-C", "/dest"]),
            Some(("/a.tar", "/dest"))
        );
        assert_eq!(
            tar_operands(&["-C", "/dest", "-xf", "/a.tar"]),
            Some(("/a.tar", "/dest"))
        );
        assert_eq!(tar_operands(&["-xf", "/a.tar"]), None);
    }
}
