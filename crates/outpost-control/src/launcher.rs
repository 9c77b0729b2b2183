//! Tunnel processes
//!
//! A tunnel is an external program (normally `ssh -N -L`) that listens on a
//! pool port and forwards to the agent. The launcher starts it, stops it, and
//! reports which tunnel processes are running on this host regardless of what
//! the session table says; the orphan sweep compares the two.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::LaunchError;

const PIDFILE_PREFIX: &str = "tunnel-";
const PIDFILE_SUFFIX: &str = ".pid";

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub session_id: String,
    pub agent_id: String,
    pub local_port: u16,
    /// Host the tunnel program connects to
    pub tunnel_host: String,
    /// Address on the far side the tunnel forwards to
    pub target_address: String,
}

/// A running tunnel process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelProcess {
    pub pid: u32,
    pub local_port: u16,
}

#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, spec: &TunnelSpec) -> Result<TunnelProcess, LaunchError>;

    /// Stop a tunnel process. Stopping a process that already exited succeeds.
    async fn terminate(&self, process: TunnelProcess) -> Result<(), LaunchError>;

    /// Tunnel processes currently alive on this host
    async fn running(&self) -> Result<Vec<TunnelProcess>, LaunchError>;
}

/// Launches a configurable command per tunnel and tracks it with pid files.
///
/// Arguments may contain `{port}`, `{host}`, `{target}` and `{agent}`
/// placeholders. Pid files (`tunnel-{port}.pid`) live in `run_dir` so
/// processes left behind by a crashed manager are still found.
pub struct SshTunnelLauncher {
    program: String,
    args: Vec<String>,
    run_dir: PathBuf,
    /// Processes spawned by this manager, keyed by pid, so they can be reaped
    children: Mutex<HashMap<u32, Child>>,
    /// How long a fresh process must stay up to count as started
    startup_grace: Duration,
    /// How long to wait after SIGTERM before SIGKILL
    stop_grace: Duration,
}

impl SshTunnelLauncher {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            run_dir: run_dir.into(),
            children: Mutex::new(HashMap::new()),
            startup_grace: Duration::from_millis(300),
            stop_grace: Duration::from_secs(3),
        }
    }

    /// `ssh -N -L 127.0.0.1:{port}:{target} {host}` with keepalives and no prompts
    pub fn ssh(run_dir: impl Into<PathBuf>) -> Self {
        let args = [
            "-N",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "BatchMode=yes",
            "-o",
            "ServerAliveInterval=15",
            "-o",
            "ServerAliveCountMax=3",
            "-L",
            "127.0.0.1:{port}:{target}",
            "{host}",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        Self::new("ssh", args, run_dir)
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn render_args(&self, spec: &TunnelSpec) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &spec.local_port.to_string())
                    .replace("{host}", &spec.tunnel_host)
                    .replace("{target}", &spec.target_address)
                    .replace("{agent}", &spec.agent_id)
            })
            .collect()
    }

    fn pidfile(&self, port: u16) -> PathBuf {
        self.run_dir
            .join(format!("{}{}{}", PIDFILE_PREFIX, port, PIDFILE_SUFFIX))
    }

    fn port_from_pidfile(path: &Path) -> Option<u16> {
        path.file_name()?
            .to_str()?
            .strip_prefix(PIDFILE_PREFIX)?
            .strip_suffix(PIDFILE_SUFFIX)?
            .parse()
            .ok()
    }

    fn take_child(&self, pid: u32) -> Option<Child> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid)
    }

    /// Whether `pid` is still running; reaps it if it is our own exited child
    fn check_alive(&self, pid: u32) -> bool {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match children.get_mut(&pid) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                _ => {
                    children.remove(&pid);
                    false
                }
            },
            None => is_alive(pid),
        }
    }

    async fn pidfile_pid(&self, port: u16) -> Option<u32> {
        tokio::fs::read_to_string(self.pidfile(port))
            .await
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    async fn remove_pidfile(&self, port: u16) {
        if let Err(e) = tokio::fs::remove_file(self.pidfile(port)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(port, "Failed to remove pid file: {}", e);
            }
        }
    }
}

/// A spawned tunnel process that has not finished starting up
struct PendingLaunch {
    child: Option<Child>,
    pidfile: PathBuf,
}

impl PendingLaunch {
    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Hand the child over to the launcher; dropping afterwards is a no-op
    fn commit(&mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!("Abandoned tunnel process already gone: {}", e);
        } else {
            warn!(pid = ?child.id(), "Killed tunnel process abandoned during startup");
        }
        if let Err(e) = std::fs::remove_file(&self.pidfile) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.pidfile.display(), "Failed to remove pid file: {}", e);
            }
        }
    }
}

fn to_pid(pid: u32) -> Result<Pid, LaunchError> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| LaunchError::Signal {
            pid,
            reason: "pid out of range".to_string(),
        })
}

/// Signal 0 probes for existence without touching the process
fn is_alive(pid: u32) -> bool {
    match to_pid(pid) {
        Ok(pid) => !matches!(signal::kill(pid, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<TunnelProcess, LaunchError> {
        tokio::fs::create_dir_all(&self.run_dir).await?;

        let args = self.render_args(spec);
        debug!(program = %self.program, ?args, "Spawning tunnel process");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    LaunchError::Fatal(format!("cannot run {}: {}", self.program, e))
                }
                _ => LaunchError::Transient(format!("spawn failed: {}", e)),
            })?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Transient("process exited immediately".to_string()))?;

        // From here on the process is visible to `running()`. Until it is
        // registered below, dropping `pending` (startup failure, or the caller's
        // setup timeout cancelling this future) kills it and removes the pid file.
        let pidfile = self.pidfile(spec.local_port);
        let mut pending = PendingLaunch {
            child: Some(child),
            pidfile: pidfile.clone(),
        };
        tokio::fs::write(&pidfile, pid.to_string()).await?;

        tokio::time::sleep(self.startup_grace).await;
        let exited = match pending.child_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        if let Some(status) = exited {
            return Err(LaunchError::Transient(format!(
                "tunnel process exited during startup: {}",
                status
            )));
        }

        if let Some(child) = pending.commit() {
            self.children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(pid, child);
        }

        info!(
            pid,
            local_port = spec.local_port,
            agent_id = %spec.agent_id,
            "Tunnel process started"
        );
        Ok(TunnelProcess {
            pid,
            local_port: spec.local_port,
        })
    }

    async fn terminate(&self, process: TunnelProcess) -> Result<(), LaunchError> {
        let pid = to_pid(process.pid)?;

        // Only signal pids we can vouch for; a recycled pid must not be killed
        let owned = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&process.pid);
        if !owned && self.pidfile_pid(process.local_port).await != Some(process.pid) {
            debug!(
                pid = process.pid,
                local_port = process.local_port,
                "No matching pid file, treating tunnel process as gone"
            );
            return Ok(());
        }

        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.take_child(process.pid);
                self.remove_pidfile(process.local_port).await;
                return Ok(());
            }
            Err(e) => {
                return Err(LaunchError::Signal {
                    pid: process.pid,
                    reason: e.to_string(),
                })
            }
        }

        if let Some(mut child) = self.take_child(process.pid) {
            if tokio::time::timeout(self.stop_grace, child.wait())
                .await
                .is_err()
            {
                warn!(pid = process.pid, "Tunnel process ignored SIGTERM, killing");
                child.kill().await?;
            }
        } else {
            // Not our child (left over from an earlier run): poll until it is gone
            let deadline = tokio::time::Instant::now() + self.stop_grace;
            while is_alive(process.pid) {
                if tokio::time::Instant::now() >= deadline {
                    warn!(pid = process.pid, "Tunnel process ignored SIGTERM, killing");
                    match signal::kill(pid, Signal::SIGKILL) {
                        Ok(()) | Err(Errno::ESRCH) => break,
                        Err(e) => {
                            return Err(LaunchError::Signal {
                                pid: process.pid,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.remove_pidfile(process.local_port).await;
        info!(
            pid = process.pid,
            local_port = process.local_port,
            "Tunnel process stopped"
        );
        Ok(())
    }

    async fn running(&self) -> Result<Vec<TunnelProcess>, LaunchError> {
        let mut entries = match tokio::fs::read_dir(&self.run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut processes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(local_port) = Self::port_from_pidfile(&path) else {
                continue;
            };

            match self.pidfile_pid(local_port).await {
                Some(pid) if self.check_alive(pid) => {
                    processes.push(TunnelProcess { pid, local_port })
                }
                _ => {
                    debug!(path = %path.display(), "Removing stale pid file");
                    self.remove_pidfile(local_port).await;
                }
            }
        }

        processes.sort_by_key(|process| process.local_port);
        Ok(processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(port: u16) -> TunnelSpec {
        TunnelSpec {
            session_id: "sess-1".to_string(),
            agent_id: "A7".to_string(),
            local_port: port,
            tunnel_host: "fw7.example.net".to_string(),
            target_address: "127.0.0.1:443".to_string(),
        }
    }

    #[test]
    fn test_render_ssh_args() {
        let launcher = SshTunnelLauncher::ssh("/tmp/outpost");
        let args = launcher.render_args(&spec(8123));

        assert!(args.contains(&"127.0.0.1:8123:127.0.0.1:443".to_string()));
        assert_eq!(args.last().unwrap(), "fw7.example.net");
    }

    #[test]
    fn test_pidfile_naming() {
        let launcher = SshTunnelLauncher::ssh("/run/outpost");
        let path = launcher.pidfile(8150);

        assert_eq!(path, PathBuf::from("/run/outpost/tunnel-8150.pid"));
        assert_eq!(SshTunnelLauncher::port_from_pidfile(&path), Some(8150));
        assert_eq!(
            SshTunnelLauncher::port_from_pidfile(Path::new("/run/outpost/other.pid")),
            None
        );
    }

    #[tokio::test]
    async fn test_launch_and_terminate_real_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = SshTunnelLauncher::new("sleep", vec!["30".to_string()], dir.path())
            .with_startup_grace(Duration::from_millis(50));

        let process = launcher.launch(&spec(8190)).await.unwrap();
        assert_eq!(process.local_port, 8190);
        assert_eq!(launcher.running().await.unwrap(), vec![process]);

        launcher.terminate(process).await.unwrap();
        assert!(launcher.running().await.unwrap().is_empty());

        // Second terminate is a no-op
        launcher.terminate(process).await.unwrap();
    }

    fn process_gone(pid: u32) -> bool {
        // An exited child not yet reaped still answers signal 0; check its state
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_cancelled_launch_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started.pid");
        let script = format!("echo $$ > {}; exec sleep 30", marker.display());
        let launcher = SshTunnelLauncher::new(
            "sh",
            vec!["-c".to_string(), script],
            dir.path().join("run"),
        )
        .with_startup_grace(Duration::from_millis(500));

        let outcome =
            tokio::time::timeout(Duration::from_millis(200), launcher.launch(&spec(8193))).await;
        assert!(outcome.is_err(), "launch should still be in its startup grace");

        let pid: u32 = std::fs::read_to_string(&marker)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !process_gone(pid) {
            assert!(
                std::time::Instant::now() < deadline,
                "tunnel process {} outlived the cancelled launch",
                pid
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(launcher.running().await.unwrap().is_empty());
        assert!(!dir.path().join("run").join("tunnel-8193.pid").exists());
    }

    #[tokio::test]
    async fn test_pidfile_written_during_startup() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(
            SshTunnelLauncher::new("sleep", vec!["30".to_string()], dir.path())
                .with_startup_grace(Duration::from_millis(400)),
        );

        let launching = {
            let launcher = launcher.clone();
            tokio::spawn(async move { launcher.launch(&spec(8194)).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Visible to the orphan sweep before startup completes
        let running = launcher.running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].local_port, 8194);

        let process = launching.await.unwrap().unwrap();
        assert_eq!(running[0], process);
        launcher.terminate(process).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = SshTunnelLauncher::new("false", Vec::new(), dir.path())
            .with_startup_grace(Duration::from_millis(200));

        let err = launcher.launch(&spec(8191)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!dir.path().join("tunnel-8191.pid").exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let launcher =
            SshTunnelLauncher::new("/nonexistent/outpost-tunnel", Vec::new(), dir.path());

        let err = launcher.launch(&spec(8192)).await.unwrap_err();
        assert!(matches!(err, LaunchError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_stale_pidfile_removed() {
        let dir = tempfile::tempdir().unwrap();
        // Pid from the top of the range will not exist
        std::fs::write(dir.path().join("tunnel-8100.pid"), "4194000").unwrap();

        let launcher = SshTunnelLauncher::ssh(dir.path());
        assert!(launcher.running().await.unwrap().is_empty());
        assert!(!dir.path().join("tunnel-8100.pid").exists());
    }
}
