//! Supervision of one external long-running process
//!
//! The supervisor exclusively owns the child handle. It starts the process,
//! gates on a health probe, and stops it with SIGTERM followed by SIGKILL once
//! the grace period runs out. The child is spawned with `kill_on_drop`, so a
//! supervisor dropped on an error path never leaves the process behind.

use crate::backoff::BackoffPolicy;
use crate::error::{BootstrapError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How to launch a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Name used in logs and errors
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Passed to the child verbatim
    pub env: BTreeMap<String, String>,
    /// Also pass this process's environment (explicit `env` entries win)
    pub inherit_env: bool,
    pub working_dir: Option<PathBuf>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            inherit_env: false,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for logs and errors
    pub fn command_line(&self) -> String {
        let mut line = self.command.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Spawned, health not yet confirmed
    Starting,
    Healthy,
    Stopping,
    Stopped,
    /// Health never confirmed, or the process exited early
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Healthy => "healthy",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Owner of one running child process
pub struct ServiceSupervisor {
    spec: ServiceSpec,
    child: Option<Child>,
    pid: Option<u32>,
    state: ServiceState,
}

impl ServiceSupervisor {
    /// Spawn the service. Spawn failures are returned immediately and never retried.
    pub fn start(spec: ServiceSpec) -> Result<Self> {
        info!(name = %spec.name, command = %spec.command_line(), "Starting service");

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if !spec.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| BootstrapError::ProcessSpawn {
            name: spec.name.clone(),
            command: spec.command_line(),
            source,
        })?;
        let pid = child.id();
        info!(name = %spec.name, pid, "Service spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.name.clone(), "stderr", stderr);
        }

        Ok(Self {
            spec,
            child: Some(child),
            pid,
            state: ServiceState::Starting,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// OS process id, if the process was spawned
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Poll `probe` under `policy` until it passes.
    ///
    /// Fails with `ProcessExited` as soon as the child exits and with
    /// `HealthTimeout` once the deadline passes. Either failure moves the
    /// state to `Failed`; the process is not stopped here.
    pub async fn wait_healthy<F, Fut>(&mut self, probe: F, policy: &BackoffPolicy) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        if self.state != ServiceState::Starting {
            return Err(BootstrapError::InvalidState {
                operation: "wait for health",
                state: self.state.to_string(),
            });
        }
        let child = self.child.as_mut().ok_or_else(|| BootstrapError::InvalidState {
            operation: "wait for health",
            state: "without a process".to_string(),
        })?;

        let outcome = tokio::select! {
            result = policy.wait_until(probe) => Ok(result),
            status = child.wait() => Err(status),
        };

        match outcome {
            Ok(Ok(attempts)) => {
                info!(name = %self.spec.name, attempts, "Service healthy");
                self.state = ServiceState::Healthy;
                Ok(())
            }
            Ok(Err(timeout)) => {
                warn!(
                    name = %self.spec.name,
                    attempts = timeout.attempts,
                    error = %timeout.last_error,
                    "Service did not become healthy"
                );
                self.state = ServiceState::Failed;
                Err(BootstrapError::HealthTimeout {
                    name: self.spec.name.clone(),
                    elapsed: timeout.elapsed,
                    attempts: timeout.attempts,
                    last_error: timeout.last_error,
                })
            }
            Err(status) => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                warn!(name = %self.spec.name, %status, "Service exited during startup");
                self.state = ServiceState::Failed;
                Err(BootstrapError::ProcessExited {
                    name: self.spec.name.clone(),
                    status,
                })
            }
        }
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// The child is always reaped. Calling this again, or on a process that
    /// already exited, is a no-op.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.state = ServiceState::Stopped;
            return Ok(());
        };
        self.state = ServiceState::Stopping;
        let name = self.spec.name.clone();

        if let Ok(Some(status)) = child.try_wait() {
            debug!(name = %name, %status, "Service already exited");
            self.state = ServiceState::Stopped;
            return Ok(());
        }

        if let Some(pid) = child.id() {
            info!(name = %name, pid, "Sending SIGTERM to service");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        let result = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(name = %name, %status, "Service exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(name = %name, error = %e, "Error waiting for service to exit, killing");
                child
                    .kill()
                    .await
                    .map_err(|source| BootstrapError::Termination { name: name.clone(), source })
            }
            Err(_) => {
                warn!(
                    name = %name,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                child
                    .kill()
                    .await
                    .map_err(|source| BootstrapError::Termination { name: name.clone(), source })
            }
        };

        self.state = ServiceState::Stopped;
        result
    }
}

impl fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("name", &self.spec.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        if self.child.is_some() {
            debug!(name = %self.spec.name, pid = self.pid, "Supervisor dropped with live process, killing");
        }
    }
}

fn forward_output<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(service = %name, stream, "{}", line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn quick_policy(timeout_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn sleeper() -> ServiceSpec {
        ServiceSpec::new("sleeper", "sleep").arg("60").inherit_env(true)
    }

    fn is_alive(pid: u32) -> bool {
        // Signal 0 only checks for existence; reaped children are gone
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[tokio::test]
    async fn test_start_and_stop_twice() {
        let mut service = ServiceSupervisor::start(sleeper()).unwrap();
        assert_eq!(service.state(), ServiceState::Starting);
        let pid = service.pid().unwrap();
        assert!(is_alive(pid));

        service.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!is_alive(pid));

        service.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_debug_shows_name_and_state() {
        let mut service = ServiceSupervisor::start(sleeper()).unwrap();
        let debug = format!("{:?}", service);
        assert!(debug.contains("sleeper"), "{debug}");
        assert!(debug.contains("Starting"), "{debug}");
        service.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let spec = ServiceSpec::new("ghost", "/nonexistent/bin/ghost");
        match ServiceSupervisor::start(spec) {
            Err(BootstrapError::ProcessSpawn { name, command, .. }) => {
                assert_eq!(name, "ghost");
                assert_eq!(command, "/nonexistent/bin/ghost");
            }
            Err(other) => panic!("expected ProcessSpawn, got {other:?}"),
            Ok(_) => panic!("spawn of a missing binary succeeded"),
        }
    }

    #[tokio::test]
    async fn test_healthy_after_probe_passes() {
        let mut service = ServiceSupervisor::start(sleeper()).unwrap();
        service
            .wait_healthy(|| async { Ok(true) }, &quick_policy(500))
            .await
            .unwrap();
        assert_eq!(service.state(), ServiceState::Healthy);

        let err = service
            .wait_healthy(|| async { Ok(true) }, &quick_policy(500))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidState { .. }));

        service.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_timeout_marks_failed() {
        let mut service = ServiceSupervisor::start(sleeper()).unwrap();
        let err = service
            .wait_healthy(
                || async { Err::<bool, _>(anyhow::anyhow!("connection refused")) },
                &quick_policy(100),
            )
            .await
            .unwrap_err();

        match err {
            BootstrapError::HealthTimeout { name, last_error, .. } => {
                assert_eq!(name, "sleeper");
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("expected HealthTimeout, got {other:?}"),
        }
        assert_eq!(service.state(), ServiceState::Failed);

        let pid = service.pid().unwrap();
        assert!(is_alive(pid), "failed health does not stop the process");
        service.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let spec = ServiceSpec::new("crasher", "/bin/sh").args(["-c", "exit 3"]);
        let mut service = ServiceSupervisor::start(spec).unwrap();
        let err = service
            .wait_healthy(|| async { Ok(false) }, &quick_policy(5_000))
            .await
            .unwrap_err();

        match err {
            BootstrapError::ProcessExited { name, status } => {
                assert_eq!(name, "crasher");
                assert!(status.contains('3'), "status: {status}");
            }
            other => panic!("expected ProcessExited, got {other:?}"),
        }
        assert_eq!(service.state(), ServiceState::Failed);

        // Stopping an exited process is a no-op
        service.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_environment_is_explicit() {
        let spec = ServiceSpec::new("env-check", "/bin/sh")
            .args(["-c", r#"test -z "$HOME" && test "$GATEWAY_MODE" = edge"#])
            .env("GATEWAY_MODE", "edge");
        let mut service = ServiceSupervisor::start(spec).unwrap();
        let err = service
            .wait_healthy(|| async { Ok(false) }, &quick_policy(5_000))
            .await
            .unwrap_err();

        match err {
            BootstrapError::ProcessExited { status, .. } => {
                assert_eq!(status, "exit status: 0");
            }
            other => panic!("expected ProcessExited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_term_ignoring_process_is_killed() {
        let spec = ServiceSpec::new("stubborn", "/bin/sh")
            .args(["-c", "trap '' TERM; exec sleep 60"])
            .inherit_env(true);
        let mut service = ServiceSupervisor::start(spec).unwrap();
        let pid = service.pid().unwrap();
        // Let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grace = Duration::from_millis(300);
        let start = Instant::now();
        service.stop(grace).await.unwrap();

        assert!(start.elapsed() >= grace);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_command_line() {
        let spec = ServiceSpec::new("traefik", "/opt/traefik").args(["--api", "--log.level=debug"]);
        assert_eq!(spec.command_line(), "/opt/traefik --api --log.level=debug");
    }
}
