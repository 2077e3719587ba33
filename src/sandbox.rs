//! Sandbox Manager.
//!
//! A sandbox is a throwaway server instance identified by its port. Each
//! one lives in `<root>/<port>/` with its own `my.cnf`, data directory and
//! error log. The manager owns every sandbox it deployed; dropping the
//! manager destroys whatever is still alive.

use crate::schema::{PortsConfig, SandboxConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Longest socket path we hand to the server. `sun_path` is 108 bytes on
/// Linux and 104 on macOS.
const MAX_SOCKET_PATH: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CONFIG_FILE: &str = "my.cnf";
const SNAPSHOT_FILE: &str = "my.cnf.snapshot";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox {port} exists: {reason}")]
    Exists { port: u16, reason: String },
    #[error("no sandbox on port {0}")]
    NotFound(u16),
    #[error("no server binary for '{0}'")]
    BinaryNotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error("initializing sandbox {port} failed: {detail}")]
    InitFailed { port: u16, detail: String },
    #[error("sandbox {port} failed to start: {detail}")]
    StartFailed { port: u16, detail: String },
    #[error("sandbox {port} did not accept connections within {secs}s")]
    StartTimeout { port: u16, secs: u64 },
    #[error("sandbox {0} has no configuration snapshot")]
    NoSnapshot(u16),
    #[error("invalid port configuration: {0}")]
    Ports(String),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SandboxError {
    let context = context.into();
    move |source| SandboxError::Io { context, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Deployed,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxState::Deployed => "DEPLOYED",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Destroyed => "DESTROYED",
        })
    }
}

/// Options accepted by [`SandboxManager::deploy`].
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Version tag (`"5.7"`) or path of the server binary.
    pub mysqld: Option<String>,
    /// Value written as `report_host` to the server config.
    pub report_host: Option<String>,
    /// Start the server after initializing it.
    pub start: bool,
}

#[derive(Debug)]
pub struct Sandbox {
    pub port: u16,
    pub dir: PathBuf,
    pub binary: PathBuf,
    pub config_snapshot: Option<String>,
    pub state: SandboxState,
    socket: PathBuf,
    child: Option<Child>,
}

impl Sandbox {
    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn error_log(&self) -> PathBuf {
        self.dir.join("error.log")
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn reap(&mut self) -> bool {
        match &mut self.child {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }
}

/// Owns the sandboxes of one worker.
pub struct SandboxManager {
    root: PathBuf,
    binaries: BTreeMap<String, PathBuf>,
    default_binary: Option<PathBuf>,
    start_timeout: Duration,
    stop_timeout: Duration,
    sandboxes: BTreeMap<u16, Sandbox>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, config: &SandboxConfig) -> Self {
        Self {
            root: root.into(),
            binaries: config.binaries.clone(),
            default_binary: config.default_binary.clone(),
            start_timeout: Duration::from_secs(config.start_timeout),
            stop_timeout: Duration::from_secs(config.stop_timeout),
            sandboxes: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, port: u16) -> Option<&Sandbox> {
        self.sandboxes.get(&port)
    }

    /// Ports of every sandbox that has not been destroyed.
    pub fn live_ports(&self) -> Vec<u16> {
        self.sandboxes.keys().copied().collect()
    }

    /// Resolve a version tag or path to a server binary.
    pub fn resolve_binary(&self, wanted: Option<&str>) -> Result<PathBuf, SandboxError> {
        let Some(wanted) = wanted else {
            return Ok(self
                .default_binary
                .clone()
                .unwrap_or_else(|| PathBuf::from("mysqld")));
        };
        if let Some(path) = self.binaries.get(wanted) {
            return Ok(path.clone());
        }
        if wanted == "5.7"
            && let Ok(path) = std::env::var("MYSQLD57_PATH")
            && !path.is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        if wanted.contains(std::path::MAIN_SEPARATOR) {
            return Ok(PathBuf::from(wanted));
        }
        Err(SandboxError::BinaryNotFound(wanted.to_string()))
    }

    /// Create and initialize a sandbox on `port`. On failure nothing is
    /// left behind on disk.
    pub fn deploy(
        &mut self,
        port: u16,
        root_password: &str,
        options: &DeployOptions,
    ) -> Result<(), SandboxError> {
        if self.sandboxes.contains_key(&port) {
            return Err(SandboxError::Exists {
                port,
                reason: "already deployed".to_string(),
            });
        }
        if !port_is_free(port) {
            return Err(SandboxError::Exists {
                port,
                reason: "port is in use".to_string(),
            });
        }
        let dir = self.root.join(port.to_string());
        if dir_is_non_empty(&dir) {
            return Err(SandboxError::Exists {
                port,
                reason: format!("{} is not empty", dir.display()),
            });
        }
        let binary = self.resolve_binary(options.mysqld.as_deref())?;

        let sandbox = Sandbox {
            port,
            socket: socket_path(&dir, port),
            dir,
            binary,
            config_snapshot: None,
            state: SandboxState::Deployed,
            child: None,
        };
        if let Err(e) = initialize(&sandbox, root_password, options) {
            let _ = fs::remove_dir_all(&sandbox.dir);
            return Err(e);
        }
        tracing::info!(port, dir = %sandbox.dir.display(), binary = %sandbox.binary.display(), "sandbox deployed");

        self.sandboxes.insert(port, sandbox);
        if options.start
            && let Err(e) = self.start(port)
        {
            if let Err(cleanup) = self.destroy(port) {
                tracing::warn!(port, error = %cleanup, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Start the server and wait until it accepts TCP connections.
    pub fn start(&mut self, port: u16) -> Result<(), SandboxError> {
        let timeout = self.start_timeout;
        let sandbox = self
            .sandboxes
            .get_mut(&port)
            .ok_or(SandboxError::NotFound(port))?;
        if sandbox.state == SandboxState::Running && !sandbox.reap() {
            return Ok(());
        }

        let out = File::create(sandbox.dir.join("server.out"))
            .map_err(io_err(format!("create output file for sandbox {port}")))?;
        let err = out
            .try_clone()
            .map_err(io_err(format!("create output file for sandbox {port}")))?;
        let child = Command::new(&sandbox.binary)
            .arg(format!("--defaults-file={}", sandbox.config_path().display()))
            .current_dir(&sandbox.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .spawn()
            .map_err(io_err(format!("spawn {}", sandbox.binary.display())))?;
        tracing::debug!(port, pid = child.id(), "sandbox starting");
        sandbox.child = Some(child);

        let deadline = Instant::now() + timeout;
        loop {
            if sandbox.reap() {
                sandbox.child = None;
                sandbox.state = SandboxState::Stopped;
                return Err(SandboxError::StartFailed {
                    port,
                    detail: log_tail(sandbox),
                });
            }
            if accepts_connections(port) {
                sandbox.state = SandboxState::Running;
                tracing::info!(port, "sandbox running");
                return Ok(());
            }
            if Instant::now() >= deadline {
                if let Some(mut child) = sandbox.child.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                sandbox.state = SandboxState::Stopped;
                return Err(SandboxError::StartTimeout {
                    port,
                    secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Ask the server to shut down, killing it if it outlives the stop
    /// timeout. Stopping a stopped sandbox does nothing.
    pub fn stop(&mut self, port: u16) -> Result<(), SandboxError> {
        let timeout = self.stop_timeout;
        let sandbox = self
            .sandboxes
            .get_mut(&port)
            .ok_or(SandboxError::NotFound(port))?;
        if let Some(mut child) = sandbox.child.take() {
            terminate(&mut child);
            let deadline = Instant::now() + timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        tracing::warn!(port, "sandbox ignored SIGTERM, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => std::thread::sleep(POLL_INTERVAL),
                }
            }
        }
        if sandbox.state != SandboxState::Deployed {
            sandbox.state = SandboxState::Stopped;
        }
        tracing::info!(port, "sandbox stopped");
        Ok(())
    }

    /// Kill the server without a clean shutdown.
    pub fn kill(&mut self, port: u16) -> Result<(), SandboxError> {
        let sandbox = self
            .sandboxes
            .get_mut(&port)
            .ok_or(SandboxError::NotFound(port))?;
        if let Some(mut child) = sandbox.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if sandbox.state != SandboxState::Deployed {
            sandbox.state = SandboxState::Stopped;
        }
        tracing::info!(port, "sandbox killed");
        Ok(())
    }

    /// Kill the server if needed, delete its directory and release the
    /// port. Destroying an unknown port does nothing.
    pub fn destroy(&mut self, port: u16) -> Result<(), SandboxError> {
        let Some(mut sandbox) = self.sandboxes.remove(&port) else {
            return Ok(());
        };
        if let Some(mut child) = sandbox.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        sandbox.state = SandboxState::Destroyed;
        if !sandbox.socket.starts_with(&sandbox.dir) {
            let _ = fs::remove_file(&sandbox.socket);
        }
        if sandbox.dir.exists() {
            fs::remove_dir_all(&sandbox.dir)
                .map_err(io_err(format!("remove {}", sandbox.dir.display())))?;
        }
        tracing::info!(port, "sandbox destroyed");
        Ok(())
    }

    /// Save the current `my.cnf` so it can be restored later.
    pub fn snapshot_conf(&mut self, port: u16) -> Result<(), SandboxError> {
        let sandbox = self
            .sandboxes
            .get_mut(&port)
            .ok_or(SandboxError::NotFound(port))?;
        let conf = fs::read_to_string(sandbox.config_path())
            .map_err(io_err(format!("read config of sandbox {port}")))?;
        fs::write(sandbox.dir.join(SNAPSHOT_FILE), &conf)
            .map_err(io_err(format!("write config snapshot of sandbox {port}")))?;
        sandbox.config_snapshot = Some(conf);
        tracing::debug!(port, "sandbox config snapshotted");
        Ok(())
    }

    /// Put the snapshotted `my.cnf` back.
    pub fn restore_conf(&mut self, port: u16) -> Result<(), SandboxError> {
        let sandbox = self
            .sandboxes
            .get(&port)
            .ok_or(SandboxError::NotFound(port))?;
        let conf = sandbox
            .config_snapshot
            .as_ref()
            .ok_or(SandboxError::NoSnapshot(port))?;
        fs::write(sandbox.config_path(), conf)
            .map_err(io_err(format!("restore config of sandbox {port}")))?;
        tracing::debug!(port, "sandbox config restored");
        Ok(())
    }

    /// Call `f` for every live sandbox, continuing after failures. Returns
    /// the failures.
    pub fn for_each_live<F>(&mut self, mut f: F) -> Vec<(u16, SandboxError)>
    where
        F: FnMut(&mut Self, u16) -> Result<(), SandboxError>,
    {
        let mut errors = Vec::new();
        for port in self.live_ports() {
            if let Err(e) = f(self, port) {
                tracing::warn!(port, error = %e, "sandbox teardown failed");
                errors.push((port, e));
            }
        }
        errors
    }

    pub fn destroy_all(&mut self) -> Vec<(u16, SandboxError)> {
        self.for_each_live(|mgr, port| mgr.destroy(port))
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

fn initialize(
    sandbox: &Sandbox,
    root_password: &str,
    options: &DeployOptions,
) -> Result<(), SandboxError> {
    let port = sandbox.port;
    fs::create_dir_all(&sandbox.dir)
        .map_err(io_err(format!("create {}", sandbox.dir.display())))?;
    fs::write(sandbox.config_path(), render_config(sandbox, options))
        .map_err(io_err(format!("write config of sandbox {port}")))?;
    let init_file = sandbox.dir.join("init.sql");
    fs::write(
        &init_file,
        format!(
            "ALTER USER 'root'@'localhost' IDENTIFIED BY '{}';\n",
            sql_quote(root_password)
        ),
    )
    .map_err(io_err(format!("write init file of sandbox {port}")))?;

    let output = Command::new(&sandbox.binary)
        .arg(format!("--defaults-file={}", sandbox.config_path().display()))
        .arg("--initialize-insecure")
        .arg(format!("--init-file={}", init_file.display()))
        .current_dir(&sandbox.dir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SandboxError::BinaryNotFound(sandbox.binary.display().to_string())
            }
            _ => SandboxError::Io {
                context: format!("run {}", sandbox.binary.display()),
                source: e,
            },
        })?;
    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = log_tail(sandbox);
        }
        return Err(SandboxError::InitFailed { port, detail });
    }
    Ok(())
}

fn render_config(sandbox: &Sandbox, options: &DeployOptions) -> String {
    let port = sandbox.port;
    let mut conf = String::from("[mysqld]\n");
    conf.push_str(&format!("port = {port}\n"));
    conf.push_str(&format!("server_id = {port}\n"));
    conf.push_str(&format!("datadir = {}\n", cnf_quote(&sandbox.data_dir())));
    conf.push_str(&format!("socket = {}\n", cnf_quote(&sandbox.socket)));
    conf.push_str(&format!("log_error = {}\n", cnf_quote(&sandbox.error_log())));
    conf.push_str(&format!(
        "pid_file = {}\n",
        cnf_quote(&sandbox.dir.join("mysqld.pid"))
    ));
    if let Some(xport) = x_port(port) {
        conf.push_str(&format!("loose_mysqlx_port = {xport}\n"));
        let mut xsocket = sandbox.socket.clone().into_os_string();
        xsocket.push("x");
        conf.push_str(&format!("loose_mysqlx_socket = {}\n", cnf_quote(Path::new(&xsocket))));
    }
    if let Some(host) = &options.report_host {
        conf.push_str(&format!("report_host = {host}\n"));
    }
    conf
}

fn cnf_quote(path: &Path) -> String {
    let text = path.display().to_string();
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn sql_quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

/// The server socket path. Paths too long for a Unix socket go to the
/// system temp dir under a short name.
fn socket_path(dir: &Path, port: u16) -> PathBuf {
    let preferred = dir.join("mysqld.sock");
    if preferred.as_os_str().len() + 1 <= MAX_SOCKET_PATH {
        preferred
    } else {
        std::env::temp_dir().join(format!("xsh-{port}.sock"))
    }
}

/// X protocol port of a sandbox (`port * 10`), if it fits.
pub fn x_port(port: u16) -> Option<u16> {
    port.checked_mul(10)
}

/// True when nothing listens on `port` on the loopback interface.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn accepts_connections(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok()
}

fn dir_is_non_empty(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: pid belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Last lines of the error log and captured server output.
fn log_tail(sandbox: &Sandbox) -> String {
    let mut lines = Vec::new();
    for path in [sandbox.error_log(), sandbox.dir.join("server.out")] {
        if let Ok(text) = fs::read_to_string(&path) {
            lines.extend(text.lines().map(str::to_string));
        }
    }
    let skip = lines.len().saturating_sub(10);
    let tail = lines[skip..].join("\n");
    if tail.is_empty() {
        "no server output".to_string()
    } else {
        tail
    }
}

/// A contiguous block of ports handed to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub index: u16,
    pub start: u16,
    pub len: u16,
}

impl PortRange {
    /// The `n`-th port of the range, counting from 1.
    pub fn port(&self, n: u16) -> Option<u16> {
        (n >= 1 && n <= self.len).then(|| self.start + n - 1)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..self.start + self.len
    }
}

/// Hands out disjoint port ranges. Shared by all workers.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    range_size: u16,
    in_use: Mutex<Vec<bool>>,
}

impl PortAllocator {
    pub fn new(config: &PortsConfig) -> Result<Self, SandboxError> {
        if config.range_size == 0 || config.ranges == 0 {
            return Err(SandboxError::Ports(
                "range_size and ranges must be positive".to_string(),
            ));
        }
        let end = u32::from(config.base) + u32::from(config.range_size) * u32::from(config.ranges);
        if config.base == 0 || end > u32::from(u16::MAX) {
            return Err(SandboxError::Ports(format!(
                "ports {}..{end} do not fit in 1..65535",
                config.base
            )));
        }
        Ok(Self {
            base: config.base,
            range_size: config.range_size,
            in_use: Mutex::new(vec![false; usize::from(config.ranges)]),
        })
    }

    pub fn ranges(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn acquire(&self) -> Option<PortRange> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let index = in_use.iter().position(|used| !used)?;
        in_use[index] = true;
        let index = u16::try_from(index).ok()?;
        Some(PortRange {
            index,
            start: self.base + index * self.range_size,
            len: self.range_size,
        })
    }

    pub fn release(&self, range: PortRange) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = in_use.get_mut(usize::from(range.index)) {
            *slot = false;
        }
    }
}
