//! Server management - building, spawning, health checking and tearing down
//! the service under test

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Starting,
    Ready,
    Failed,
    Terminated,
}

/// Bounded readiness polling schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Interval multiplier per attempt; 1.0 keeps it fixed
    pub backoff: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Wait before the attempt following `attempt` (1-based); `None` once the
    /// budget is spent
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let cap = self.max_interval.max(self.interval);
        let factor = self.backoff.max(1.0).powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        // Overflow and non-finite factors land on the cap
        let scaled = Duration::try_from_secs_f64(self.interval.as_secs_f64() * factor).unwrap_or(cap);
        Some(scaled.min(cap))
    }

    /// Total sleep time if every attempt fails
    pub fn budget(&self) -> Duration {
        (1..self.max_attempts).filter_map(|a| self.delay_after(a)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1), 60)
    }
}

/// Configuration for building and spawning the service
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub working_dir: PathBuf,

    /// Empty = no build step
    pub build_command: Vec<String>,

    pub run_command: Vec<String>,

    pub env: BTreeMap<String, String>,

    pub host: String,

    /// Port to listen on (None = find free port); exported as `PORT`
    pub port: Option<u16>,

    pub readiness_path: String,

    /// Timeout for a single readiness probe
    pub probe_timeout: Duration,

    /// How long to wait after SIGTERM before killing
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("server"),
            build_command: vec!["cargo".to_string(), "build".to_string()],
            run_command: vec!["cargo".to_string(), "run".to_string()],
            env: BTreeMap::new(),
            host: "127.0.0.1".to_string(),
            port: Some(8080),
            readiness_path: "/".to_string(),
            probe_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// stdout and stderr collected from the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Both streams, labelled, for diagnostics
    pub fn render(&self) -> String {
        format!("STDOUT:\n{}\nSTDERR:\n{}", self.stdout, self.stderr)
    }
}

/// Builds and launches the service under test
pub struct Supervisor {
    config: ServerConfig,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the build step; a nonzero status aborts the run
    pub async fn build(&self) -> E2eResult<()> {
        let Some((program, args)) = self.config.build_command.split_first() else {
            debug!("No build command configured, skipping build");
            return Ok(());
        };
        let command = self.config.build_command.join(" ");
        info!("Building service: {} (in {})", command, self.config.working_dir.display());

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| E2eError::BuildFailure {
                command: command.clone(),
                status: format!("spawn error: {}", e),
                stderr: String::new(),
            })?;

        if !output.status.success() {
            return Err(E2eError::BuildFailure {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        info!("Build finished");
        Ok(())
    }

    /// Start the service with captured output; the handle is `Starting`
    pub async fn launch(&self) -> E2eResult<ServiceProcess> {
        let (program, args) = self
            .config
            .run_command
            .split_first()
            .ok_or_else(|| E2eError::ServerStartup("run command is empty".to_string()))?;

        let port = match self.config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://{}:{}", self.config.host, port);

        info!("Spawning service on port {}: {}", port, self.config.run_command.join(" "));

        let mut std_cmd = std::process::Command::new(program);
        std_cmd
            .args(args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so wrappers like `cargo run` go down with the server
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!(
                "Failed to spawn {} in {}: {}",
                program,
                self.config.working_dir.display(),
                e
            ))
        })?;

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(capture(out, stdout.clone(), "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(capture(err, stderr.clone(), "stderr"));
        }

        Ok(ServiceProcess {
            pid: child.id(),
            child,
            base_url: base_url.clone(),
            readiness_url: format!("{}{}", base_url, self.config.readiness_path),
            port,
            probe_timeout: self.config.probe_timeout,
            shutdown_grace: self.config.shutdown_grace,
            state: Liveness::Starting,
            stdout,
            stderr,
            readers,
            terminations: 0,
        })
    }
}

/// Handle to the running service
pub struct ServiceProcess {
    child: Child,
    pid: Option<u32>,
    base_url: String,
    readiness_url: String,
    port: u16,
    probe_timeout: Duration,
    shutdown_grace: Duration,
    state: Liveness,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
    terminations: u32,
}

impl ServiceProcess {
    pub fn state(&self) -> Liveness {
        self.state
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn readiness_url(&self) -> &str {
        &self.readiness_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of times teardown actually stopped the process (0 or 1)
    pub fn terminations(&self) -> u32 {
        self.terminations
    }

    /// Output captured so far
    pub fn output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
        }
    }

    /// Poll the readiness URL until it answers 200. Returns the number of
    /// attempts used.
    pub async fn await_ready(&mut self, policy: &RetryPolicy) -> E2eResult<u32> {
        let client = reqwest::Client::builder().timeout(self.probe_timeout).build()?;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(status) = self.child.try_wait()? {
                self.state = Liveness::Failed;
                warn!("Service exited during startup: {}", status);
                let output = self.drain_output().await;
                return Err(E2eError::ServerExited {
                    status: status.to_string(),
                    output: output.render(),
                });
            }

            match client.get(&self.readiness_url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    self.state = Liveness::Ready;
                    info!("Service is ready at {} (attempt {})", self.base_url, attempt);
                    return Ok(attempt);
                }
                Ok(resp) => {
                    debug!("Readiness probe returned {}", resp.status());
                }
                Err(e) if is_transient(&e) => {
                    if attempt == 1 {
                        info!("Waiting for service to start (up to {:?})...", policy.budget());
                    }
                    debug!("Readiness probe not answered: {}", e);
                }
                Err(e) => {
                    self.state = Liveness::Failed;
                    return Err(E2eError::Http(e));
                }
            }

            match policy.delay_after(attempt) {
                Some(delay) => sleep(delay).await,
                None => {
                    self.state = Liveness::Failed;
                    warn!("Service not ready after {} attempts", attempt);
                    return Err(E2eError::ReadinessTimeout {
                        attempts: attempt,
                        output: self.output().render(),
                    });
                }
            }
        }
    }

    /// Stop the service: SIGTERM to the group, then kill after the grace
    /// period. Returns `false` if it had already been torn down.
    pub async fn teardown(&mut self) -> E2eResult<bool> {
        if self.state == Liveness::Terminated {
            return Ok(false);
        }
        info!("Stopping service (pid: {:?})", self.pid);

        let exited = match self.child.try_wait()? {
            Some(status) => Some(status),
            None => {
                self.signal_group(false);
                match timeout(self.shutdown_grace, self.child.wait()).await {
                    Ok(status) => Some(status?),
                    Err(_) => None,
                }
            }
        };

        let status: ExitStatus = match exited {
            Some(status) => status,
            None => {
                warn!("Service ignored SIGTERM for {:?}, killing", self.shutdown_grace);
                self.signal_group(true);
                // Direct child may not be in the group on non-unix targets
                let _ = self.child.start_kill();
                self.child.wait().await?
            }
        };

        self.drain_output().await;
        self.state = Liveness::Terminated;
        self.terminations += 1;
        info!("Service stopped ({})", status);
        Ok(true)
    }

    #[cfg(unix)]
    fn signal_group(&self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
                debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _force: bool) {
        let _ = self.child.start_kill();
    }

    /// Wait for the output readers to reach EOF, then snapshot
    async fn drain_output(&mut self) -> CapturedOutput {
        for reader in self.readers.drain(..) {
            if timeout(Duration::from_secs(2), reader).await.is_err() {
                debug!("Output reader still open after process exit");
            }
        }
        self.output()
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        if self.state != Liveness::Terminated {
            #[cfg(unix)]
            self.signal_group(true);
        }
    }
}

/// Drain one output stream into a shared buffer, line by line
fn capture<R>(reader: R, sink: Arc<Mutex<String>>, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "service", stream, "{}", line);
                    let mut buf = sink.lock();
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "service", stream, "read error: {}", e);
                    break;
                }
            }
        }
    })
}

/// Connection refused/reset and probe timeouts mean "not yet"
fn is_transient(e: &reqwest::Error) -> bool {
    if e.is_connect() || e.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = err.source();
    }
    false
}

/// Find a free port to use
pub fn find_free_port() -> E2eResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port1 = find_free_port().unwrap();
        let port2 = find_free_port().unwrap();

        assert!(port1 > 1024);
        assert!(port2 > 1024);
    }

    #[test]
    fn test_fixed_policy_schedule() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 3);
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(3), None);
        assert_eq!(policy.budget(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(100),
            max_attempts: 10,
            backoff: 2.0,
            max_interval: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(10), None);
    }

    #[test]
    fn test_runaway_backoff_stays_at_cap() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(1),
            max_attempts: u32::MAX,
            backoff: 10.0,
            max_interval: Duration::from_secs(5),
        };
        for attempt in [20, 40, 1_000, u32::MAX - 1] {
            assert_eq!(policy.delay_after(attempt), Some(Duration::from_secs(5)));
        }

        let doubling = RetryPolicy {
            max_attempts: 200,
            backoff: 2.0,
            ..policy
        };
        assert_eq!(doubling.delay_after(150), Some(Duration::from_secs(5)));
        assert_eq!(doubling.budget(), Duration::from_secs(1 + 2 + 4) + Duration::from_secs(5) * 196);
    }

    #[test]
    fn test_non_finite_backoff_falls_back_to_cap() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(100),
            max_attempts: 5,
            backoff: f64::INFINITY,
            max_interval: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 1);
        assert_eq!(policy.delay_after(1), None);
        assert_eq!(policy.budget(), Duration::ZERO);
    }

    #[test]
    fn test_default_policy_matches_minute_budget() {
        assert_eq!(RetryPolicy::default().budget(), Duration::from_secs(59));
    }

    #[test]
    fn test_captured_output_render() {
        let out = CapturedOutput {
            stdout: "listening\n".into(),
            stderr: "warn\n".into(),
        };
        let rendered = out.render();
        assert!(rendered.contains("STDOUT:\nlistening"));
        assert!(rendered.contains("STDERR:\nwarn"));
        assert!(CapturedOutput::default().is_empty());
    }
}
