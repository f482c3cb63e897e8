//! Playwright browser automation
//!
//! Each session runs a small Node.js bridge that owns one Playwright page.
//! The bridge reads one JSON command per line on stdin and answers each with
//! one JSON line on stdout, so pointer and keyboard events reach the page in
//! order with only a pipe round-trip between them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::driver::{BrowserDriver, DriverLauncher, DriverResult};
use crate::error::{DriverError, DriverErrorKind};

/// Extra time the bridge gets on top of the Playwright-side timeout
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

const BRIDGE_SCRIPT: &str = r#"
const { chromium, firefox, webkit } = require('playwright');
const readline = require('readline');

const engines = { chromium, firefox, webkit };
const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const opts = JSON.parse(process.argv[2]);
  const browser = await engines[opts.browser].launch({ headless: opts.headless });
  const context = await browser.newContext({
    viewport: { width: opts.width, height: opts.height }
  });
  const page = await context.newPage();
  reply({ ok: true, value: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    const cmd = JSON.parse(line);
    try {
      let value = null;
      switch (cmd.op) {
        case 'navigate':
          await page.goto(cmd.url, { timeout: cmd.timeout_ms });
          break;
        case 'wait_for_selector':
          await page.waitForSelector(cmd.selector, { state: 'visible', timeout: cmd.timeout_ms });
          break;
        case 'move_pointer':
          await page.mouse.move(cmd.x, cmd.y);
          break;
        case 'type_char':
          await page.keyboard.type(cmd.text);
          break;
        case 'focus':
          await page.focus(cmd.selector, { timeout: cmd.timeout_ms });
          break;
        case 'click':
          await page.click(cmd.selector, { timeout: cmd.timeout_ms });
          break;
        case 'read_text':
          value = await page.textContent(cmd.selector, { timeout: cmd.timeout_ms });
          break;
        case 'read_attribute':
          value = await page.getAttribute(cmd.selector, cmd.name, { timeout: cmd.timeout_ms });
          break;
        case 'screenshot':
          await page.screenshot({ path: cmd.path, fullPage: true });
          break;
        case 'close':
          await browser.close();
          reply({ ok: true, value: null });
          process.exit(0);
        default:
          throw new Error('unknown op ' + cmd.op);
      }
      reply({ ok: true, value });
    } catch (error) {
      reply({ ok: false, error: error.message, timeout: error.name === 'TimeoutError' });
    }
  }
  await browser.close();
})().catch((error) => {
  reply({ ok: false, error: error.message, timeout: false });
  process.exit(1);
});
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser '{}'", other)),
        }
    }
}

/// Configuration for Playwright sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Node.js executable
    pub node_binary: PathBuf,
    /// `node_modules` directory that contains `playwright`
    pub node_path: Option<PathBuf>,
    pub launch_timeout_ms: u64,
    /// Timeout for navigation, clicks and reads
    pub operation_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: PathBuf::from("node"),
            node_path: None,
            launch_timeout_ms: 30_000,
            operation_timeout_ms: 10_000,
        }
    }
}

impl PlaywrightConfig {
    fn node_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.node_binary);
        if let Some(path) = &self.node_path {
            cmd.env("NODE_PATH", path);
        }
        cmd
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Navigate { url: &'a str, timeout_ms: u64 },
    WaitForSelector { selector: &'a str, timeout_ms: u64 },
    MovePointer { x: f64, y: f64 },
    TypeChar { text: String },
    Focus { selector: &'a str, timeout_ms: u64 },
    Click { selector: &'a str, timeout_ms: u64 },
    ReadText { selector: &'a str, timeout_ms: u64 },
    ReadAttribute { selector: &'a str, name: &'a str, timeout_ms: u64 },
    Screenshot { path: &'a str },
    Close,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

/// One live browser page driven through the Node bridge
pub struct PlaywrightDriver {
    child: Child,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    operation_timeout: Duration,
    closed: bool,
    // Keeps the bridge script on disk for the life of the session
    _script_dir: TempDir,
}

impl PlaywrightDriver {
    /// Start a bridge and wait until its page is open
    pub async fn launch(config: &PlaywrightConfig) -> DriverResult<Self> {
        let fail = |kind, cause: String| DriverError::new("launch", config.browser.as_str(), kind, cause);

        let script_dir = tempfile::tempdir().map_err(|e| fail(DriverErrorKind::Protocol, e.to_string()))?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT).map_err(|e| fail(DriverErrorKind::Protocol, e.to_string()))?;

        let options = serde_json::json!({
            "browser": config.browser.as_str(),
            "headless": config.headless,
            "width": config.viewport_width,
            "height": config.viewport_height,
        });

        debug!("Launching Playwright bridge: {}", script_path.display());

        let mut child = config
            .node_command()
            .arg(&script_path)
            .arg(options.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                fail(
                    DriverErrorKind::Closed,
                    format!("failed to start {}: {}", config.node_binary.display(), e),
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail(DriverErrorKind::Protocol, "bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| fail(DriverErrorKind::Protocol, "bridge stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "playwright", "{}", line);
                }
            });
        }

        let mut driver = Self {
            child,
            stdin,
            replies: BufReader::new(stdout).lines(),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
            closed: false,
            _script_dir: script_dir,
        };

        let launch_timeout = Duration::from_millis(config.launch_timeout_ms);
        match driver.read_reply("launch", config.browser.as_str(), launch_timeout).await {
            Ok(_) => {
                info!("{} session open", config.browser.as_str());
                Ok(driver)
            }
            Err(e) if e.kind == DriverErrorKind::Closed => Err(fail(
                DriverErrorKind::Closed,
                format!(
                    "{}. Is Playwright installed? (npm install playwright && npx playwright install {})",
                    e.cause,
                    config.browser.as_str()
                ),
            )),
            Err(e) => Err(e),
        }
    }

    fn error(&self, op: &'static str, target: &str, kind: DriverErrorKind, cause: impl Into<String>) -> DriverError {
        DriverError::new(op, target, kind, cause)
    }

    /// Send one command and wait for its reply
    async fn call(
        &mut self,
        op: &'static str,
        target: &str,
        command: BridgeCommand<'_>,
        wait: Duration,
    ) -> DriverResult<serde_json::Value> {
        if self.closed {
            return Err(self.error(op, target, DriverErrorKind::Closed, "browser session is closed"));
        }

        let mut line = serde_json::to_string(&command)
            .map_err(|e| self.error(op, target, DriverErrorKind::Protocol, e.to_string()))?;
        line.push('\n');

        let written = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.closed = true;
            return Err(self.error(op, target, DriverErrorKind::Closed, e.to_string()));
        }

        self.read_reply(op, target, wait + BRIDGE_GRACE).await
    }

    async fn read_reply(&mut self, op: &'static str, target: &str, wait: Duration) -> DriverResult<serde_json::Value> {
        let line = match timeout(wait, self.replies.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                self.closed = true;
                return Err(self.error(op, target, DriverErrorKind::Closed, "bridge exited"));
            }
            Ok(Err(e)) => {
                self.closed = true;
                return Err(self.error(op, target, DriverErrorKind::Closed, e.to_string()));
            }
            Err(_) => {
                // A late reply would be read as the answer to the next command
                self.closed = true;
                return Err(self.error(
                    op,
                    target,
                    DriverErrorKind::Timeout,
                    format!("no reply from bridge within {:?}", wait),
                ));
            }
        };

        let reply: BridgeReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(e) => {
                self.closed = true;
                return Err(self.error(
                    op,
                    target,
                    DriverErrorKind::Protocol,
                    format!("unparseable reply {:?}: {}", line, e),
                ));
            }
        };

        if reply.ok {
            Ok(reply.value)
        } else {
            let kind = if reply.timeout {
                DriverErrorKind::Timeout
            } else {
                DriverErrorKind::Browser
            };
            Err(self.error(op, target, kind, reply.error.unwrap_or_else(|| "unknown error".to_string())))
        }
    }

    fn millis(d: Duration) -> u64 {
        d.as_millis() as u64
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        let timeout_ms = Self::millis(self.operation_timeout);
        self.call("navigate", url, BridgeCommand::Navigate { url, timeout_ms }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> DriverResult<()> {
        let command = BridgeCommand::WaitForSelector {
            selector,
            timeout_ms: Self::millis(timeout),
        };
        self.call("wait_for_selector", selector, command, timeout).await.map(|_| ())
    }

    async fn move_pointer(&mut self, x: f64, y: f64) -> DriverResult<()> {
        let target = format!("({:.1}, {:.1})", x, y);
        self.call("move_pointer", &target, BridgeCommand::MovePointer { x, y }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn type_char(&mut self, ch: char, delay: Duration) -> DriverResult<()> {
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let text = ch.to_string();
        self.call("type_char", &text, BridgeCommand::TypeChar { text: text.clone() }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn focus(&mut self, selector: &str) -> DriverResult<()> {
        let timeout_ms = Self::millis(self.operation_timeout);
        self.call("focus", selector, BridgeCommand::Focus { selector, timeout_ms }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn click(&mut self, selector: &str) -> DriverResult<()> {
        let timeout_ms = Self::millis(self.operation_timeout);
        self.call("click", selector, BridgeCommand::Click { selector, timeout_ms }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn read_text(&mut self, selector: &str) -> DriverResult<String> {
        let timeout_ms = Self::millis(self.operation_timeout);
        let value = self
            .call("read_text", selector, BridgeCommand::ReadText { selector, timeout_ms }, self.operation_timeout)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn read_attribute(&mut self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        let timeout_ms = Self::millis(self.operation_timeout);
        let command = BridgeCommand::ReadAttribute {
            selector,
            name,
            timeout_ms,
        };
        let value = self
            .call("read_attribute", selector, command, self.operation_timeout)
            .await?;
        Ok(value.as_str().map(String::from))
    }

    async fn screenshot(&mut self, path: &Path) -> DriverResult<()> {
        let target = path.to_string_lossy().to_string();
        self.call("screenshot", &target, BridgeCommand::Screenshot { path: &target }, self.operation_timeout)
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.call("close", "session", BridgeCommand::Close, Duration::from_secs(5)).await;
        self.closed = true;

        if timeout(Duration::from_secs(5), self.child.wait()).await.is_err() {
            warn!("Playwright bridge did not exit, killing");
            let _ = self.child.kill().await;
        }
        result.map(|_| ())
    }
}

/// Launches one [`PlaywrightDriver`] per scenario
#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    config: PlaywrightConfig,
}

impl PlaywrightLauncher {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Check that node can load Playwright
    pub async fn check_installed(&self) -> DriverResult<()> {
        let status = self
            .config
            .node_command()
            .args(["-e", "require('playwright')"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(DriverError::new(
                "check_installed",
                "playwright",
                DriverErrorKind::Closed,
                "Playwright not found. Install with: npm install playwright && npx playwright install",
            )),
            Err(e) => Err(DriverError::new(
                "check_installed",
                self.config.node_binary.to_string_lossy(),
                DriverErrorKind::Closed,
                e.to_string(),
            )),
        }
    }
}

#[async_trait]
impl DriverLauncher for PlaywrightLauncher {
    async fn launch(&self) -> DriverResult<Box<dyn BrowserDriver>> {
        let driver = PlaywrightDriver::launch(&self.config).await?;
        Ok(Box::new(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(BridgeCommand::WaitForSelector {
            selector: ".success.visible",
            timeout_ms: 5000,
        })
        .unwrap();
        assert_eq!(json["op"], "wait_for_selector");
        assert_eq!(json["selector"], ".success.visible");
        assert_eq!(json["timeout_ms"], 5000);

        let json = serde_json::to_value(BridgeCommand::MovePointer { x: 100.0, y: 250.5 }).unwrap();
        assert_eq!(json["op"], "move_pointer");
        assert_eq!(json["y"], 250.5);

        let json = serde_json::to_value(BridgeCommand::Close).unwrap();
        assert_eq!(json, serde_json::json!({ "op": "close" }));
    }

    #[test]
    fn test_reply_parsing() {
        let ok: BridgeReply = serde_json::from_str(r#"{"ok":true,"value":"Verification failed."}"#).unwrap();
        assert!(ok.ok);
        assert_eq!(ok.value.as_str(), Some("Verification failed."));

        let err: BridgeReply =
            serde_json::from_str(r#"{"ok":false,"error":"Timeout 5000ms exceeded.","timeout":true}"#).unwrap();
        assert!(!err.ok);
        assert!(err.timeout);

        let null: BridgeReply = serde_json::from_str(r#"{"ok":true,"value":null}"#).unwrap();
        assert!(null.value.is_null());
    }

    #[test]
    fn test_bridge_handles_every_command() {
        for op in [
            "navigate",
            "wait_for_selector",
            "move_pointer",
            "type_char",
            "focus",
            "click",
            "read_text",
            "read_attribute",
            "screenshot",
            "close",
        ] {
            assert!(BRIDGE_SCRIPT.contains(&format!("case '{}'", op)), "bridge lacks {}", op);
        }
    }

    #[test]
    fn test_browser_parse() {
        assert_eq!("Firefox".parse::<Browser>().unwrap(), Browser::Firefox);
        assert!("lynx".parse::<Browser>().is_err());
        assert_eq!(Browser::default().as_str(), "chromium");
    }

    #[tokio::test]
    async fn test_launch_with_missing_node_fails_cleanly() {
        let config = PlaywrightConfig {
            node_binary: PathBuf::from("/nonexistent/node-binary"),
            ..Default::default()
        };
        let err = PlaywrightDriver::launch(&config).await.err().unwrap();
        assert_eq!(err.kind, DriverErrorKind::Closed);
        assert_eq!(err.op, "launch");
    }
}
