//! Harness configuration

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};
use crate::playwright::PlaywrightConfig;
use crate::profile::ProfileSettings;
use crate::server::{RetryPolicy, ServerConfig};
use crate::spec::ScenarioSpec;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Fixed RNG seed; a fresh one is drawn and logged when absent
    pub seed: Option<u64>,

    /// Where results and failure screenshots go
    pub output_dir: PathBuf,

    /// Capture a screenshot when a scenario fails
    pub screenshot_on_failure: bool,

    pub server: ServerSection,
    pub browser: PlaywrightConfig,
    pub page: PageConfig,
    pub profiles: ProfileSettings,
    pub scenarios: Vec<ScenarioSpec>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            seed: None,
            output_dir: PathBuf::from("test-results"),
            screenshot_on_failure: true,
            server: ServerSection::default(),
            browser: PlaywrightConfig::default(),
            page: PageConfig::default(),
            profiles: ProfileSettings::default(),
            scenarios: ScenarioSpec::default_suite(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> E2eResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> E2eResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the harness cannot run with
    pub fn validate(&self) -> E2eResult<()> {
        let invalid = |msg: String| Err(E2eError::Config(msg));

        if self.server.run_command.is_empty() {
            return invalid("server.run_command is empty".into());
        }
        if !self.server.skip_build && self.server.build_command.is_empty() {
            return invalid("server.build_command is empty (set skip_build to launch without building)".into());
        }
        if self.server.startup_attempts == 0 {
            return invalid("server.startup_attempts must be at least 1".into());
        }
        if !self.server.poll_backoff.is_finite() || self.server.poll_backoff < 1.0 {
            return invalid(format!(
                "server.poll_backoff must be a finite number >= 1.0, got {}",
                self.server.poll_backoff
            ));
        }
        if self.profiles.human.jitter_px < 0 {
            return invalid("profiles.human.jitter_px must not be negative".into());
        }
        if self.profiles.bot.samples < 2 || self.profiles.human.samples < 2 {
            return invalid("profiles need at least 2 pointer samples".into());
        }
        if !self.profiles.human.step_delay.is_valid() || !self.profiles.human.key_delay.is_valid() {
            return invalid("profiles.human delay ranges must have min_ms <= max_ms".into());
        }
        if self.scenarios.is_empty() {
            return invalid("no scenarios configured".into());
        }
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                return invalid(format!("duplicate scenario name '{}'", scenario.name));
            }
            if !scenario.path.starts_with('/') {
                return invalid(format!("scenario '{}' path must start with '/'", scenario.name));
            }
        }
        Ok(())
    }

    /// Supervisor configuration resolved from the server section
    pub fn server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            working_dir: s.working_dir.clone(),
            build_command: if s.skip_build { Vec::new() } else { s.build_command.clone() },
            run_command: s.run_command.clone(),
            env: s.env.clone(),
            host: s.host.clone(),
            port: if s.port == 0 { None } else { Some(s.port) },
            readiness_path: s.readiness_path.clone(),
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.server.poll_interval_ms),
            max_attempts: self.server.startup_attempts,
            backoff: self.server.poll_backoff,
            max_interval: Duration::from_millis(self.server.max_poll_interval_ms),
        }
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.output_dir.join("screenshots")
    }
}

/// How to build, launch and probe the service under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub working_dir: PathBuf,
    pub build_command: Vec<String>,
    pub run_command: Vec<String>,
    pub skip_build: bool,
    pub host: String,
    /// 0 = pick a free port
    pub port: u16,
    pub readiness_path: String,
    pub startup_attempts: u32,
    pub poll_interval_ms: u64,
    /// Multiplier applied to the poll interval after each attempt
    pub poll_backoff: f64,
    pub max_poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Extra environment for the build and run commands
    pub env: BTreeMap<String, String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("server"),
            build_command: vec!["cargo".into(), "build".into()],
            run_command: vec!["cargo".into(), "run".into()],
            skip_build: false,
            host: "127.0.0.1".to_string(),
            port: 8080,
            readiness_path: "/".to_string(),
            startup_attempts: 60,
            poll_interval_ms: 1000,
            poll_backoff: 1.0,
            max_poll_interval_ms: 5000,
            probe_timeout_ms: 2000,
            shutdown_grace_ms: 5000,
            env: BTreeMap::new(),
        }
    }
}

/// Selectors and verdict markers of the page under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub input: String,
    pub verify_button: String,
    pub result: String,
    pub success_indicator: String,
    pub failure_indicator: String,
    pub success_marker: String,
    pub failure_marker: String,
    /// Wait for the page controls after navigation
    pub ready_timeout_ms: u64,
    /// Wait for a verdict indicator after verifying
    pub verdict_timeout_ms: u64,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            input: "#testInput".to_string(),
            verify_button: "#verifyBtn".to_string(),
            result: "#result".to_string(),
            success_indicator: ".success.visible".to_string(),
            failure_indicator: ".failure.visible".to_string(),
            success_marker: "Verification successful".to_string(),
            failure_marker: "Verification failed".to_string(),
            ready_timeout_ms: 10_000,
            verdict_timeout_ms: 5_000,
        }
    }
}

impl PageConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn verdict_timeout(&self) -> Duration {
        Duration::from_millis(self.verdict_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scenarios.len(), 2);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.retry_policy().max_attempts, 60);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HarnessConfig::from_toml(
            r#"
seed = 42

[server]
working_dir = "services/sentinel"
port = 0
startup_attempts = 5

[page]
verdict_timeout_ms = 2500
"#,
        )
        .unwrap();

        assert_eq!(config.seed, Some(42));
        assert_eq!(config.server.startup_attempts, 5);
        assert_eq!(config.server.run_command, vec!["cargo", "run"]);
        assert_eq!(config.page.input, "#testInput");
        assert_eq!(config.page.verdict_timeout(), Duration::from_millis(2500));
        assert_eq!(config.server_config().port, None);
        assert_eq!(config.scenarios.len(), 2);
    }

    #[test]
    fn test_skip_build_clears_build_command() {
        let mut config = HarnessConfig::default();
        config.server.skip_build = true;
        config.server.build_command.clear();
        config.validate().unwrap();
        assert!(config.server_config().build_command.is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicate_scenarios() {
        let mut config = HarnessConfig::default();
        let first = config.scenarios[0].clone();
        config.scenarios.push(first);
        assert!(matches!(config.validate(), Err(E2eError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unusable_backoff() {
        for backoff in ["0.5", "nan", "inf"] {
            let config = HarnessConfig::from_toml(&format!("[server]\npoll_backoff = {}\n", backoff)).unwrap();
            assert!(matches!(config.validate(), Err(E2eError::Config(_))), "backoff {}", backoff);
        }
    }

    #[test]
    fn test_large_backoff_is_accepted_and_capped() {
        let config = HarnessConfig::from_toml("[server]\npoll_backoff = 10.0\n").unwrap();
        config.validate().unwrap();

        let policy = config.retry_policy();
        let cap = Duration::from_millis(config.server.max_poll_interval_ms);
        assert_eq!(policy.delay_after(40), Some(cap));
        assert!(policy.budget() <= cap * 59);
    }

    #[test]
    fn test_validate_rejects_negative_jitter() {
        let mut config = HarnessConfig::default();
        config.profiles.human.jitter_px = -1;
        assert!(matches!(config.validate(), Err(E2eError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_single_sample() {
        let mut config = HarnessConfig::default();
        config.profiles.bot.samples = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/harness.toml");
        let mut config = HarnessConfig::default();
        config.seed = Some(9);
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.seed, Some(9));
        assert_eq!(loaded.scenarios.len(), config.scenarios.len());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/harness.toml")).unwrap();
        assert_eq!(config.page.result, "#result");
    }
}
