//! Test session controller: owns the service lifecycle and runs every
//! scenario against it in order

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::HarnessConfig;
use crate::driver::DriverLauncher;
use crate::error::{E2eError, E2eResult};
use crate::profile::{Behavior, ProfileSignature};
use crate::scenario::{Artifact, ScenarioRunner, Verdict};
use crate::server::{CapturedOutput, Liveness, ServiceProcess, Supervisor};
use crate::spec::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    BuildFailed,
    LaunchFailed,
    NotReady,
    ScenarioFailed,
    Interrupted,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub behavior: Behavior,
    pub expected_success: bool,
    pub passed: bool,
    pub duration_ms: u64,
    pub verdict: Option<Verdict>,
    pub signature: ProfileSignature,
    pub error: Option<String>,
    pub screenshot: Option<Artifact>,
}

impl ScenarioOutcome {
    fn pending(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            behavior: scenario.profile.behavior(),
            expected_success: scenario.expected_success,
            passed: false,
            duration_ms: 0,
            verdict: None,
            signature: scenario.profile.signature(),
            error: None,
            screenshot: None,
        }
    }
}

/// What happened to the supervised service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub base_url: Option<String>,
    pub ready_after_attempts: Option<u32>,
    pub final_state: Option<Liveness>,
    pub terminations: u32,
}

/// Aggregate result of one harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    pub status: RunStatus,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub scenarios: Vec<ScenarioOutcome>,
    pub service: ServiceSummary,
    pub diagnostics: Vec<String>,
    /// Full service output, kept only when the run failed
    pub service_output: Option<CapturedOutput>,
    /// Scenario being driven right now; recorded as failed if the run is cut off
    #[serde(skip)]
    in_flight: Option<ScenarioOutcome>,
}

impl TestRunResult {
    fn new(seed: u64, total: usize) -> Self {
        Self {
            status: RunStatus::Passed,
            seed,
            started_at: Utc::now(),
            duration_ms: 0,
            total,
            passed: 0,
            failed: 0,
            skipped: total,
            scenarios: Vec::new(),
            service: ServiceSummary::default(),
            diagnostics: Vec::new(),
            service_output: None,
            in_flight: None,
        }
    }

    fn record(&mut self, outcome: ScenarioOutcome) {
        if outcome.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.skipped = self.total.saturating_sub(self.passed + self.failed);
        self.scenarios.push(outcome);
    }

    pub fn success(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// Human-readable failure report, service output verbatim at the end
    pub fn failure_report(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let mut report = format!("Test FAILED ({:?})\n", self.status);
        for line in &self.diagnostics {
            report.push_str(line);
            report.push('\n');
        }
        if let Some(output) = &self.service_output {
            report.push_str("SERVER OUTPUT:\n");
            report.push_str(&output.stdout);
            report.push('\n');
            report.push_str(&output.stderr);
        }
        Some(report)
    }
}

/// Runs the whole suite against a freshly launched service
pub struct TestSession {
    config: HarnessConfig,
    launcher: Arc<dyn DriverLauncher>,
}

impl TestSession {
    pub fn new(config: HarnessConfig, launcher: Arc<dyn DriverLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Run until done or until SIGINT/SIGTERM
    pub async fn run(&self) -> TestRunResult {
        self.run_until(shutdown_signal()).await
    }

    /// Run until done or until `shutdown` resolves. The service is torn down
    /// exactly once on every path out of here.
    pub async fn run_until<F>(&self, shutdown: F) -> TestRunResult
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!("Interaction seed: {} (set `seed = {}` to reproduce)", seed, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut result = TestRunResult::new(seed, self.config.scenarios.len());

        let supervisor = Supervisor::new(self.config.server_config());
        if let Err(e) = supervisor.build().await {
            error!("{}", e);
            result.diagnostics.push(e.to_string());
            if let E2eError::BuildFailure { stderr, .. } = &e {
                if !stderr.is_empty() {
                    result.diagnostics.push(stderr.clone());
                }
            }
            return self.finish(result, RunStatus::BuildFailed, started);
        }

        let mut process = match supervisor.launch().await {
            Ok(process) => process,
            Err(e) => {
                error!("{}", e);
                result.diagnostics.push(e.to_string());
                return self.finish(result, RunStatus::LaunchFailed, started);
            }
        };
        result.service.base_url = Some(process.base_url().to_string());

        tokio::pin!(shutdown);
        let status = tokio::select! {
            status = self.drive(&mut process, &mut rng, &mut result) => status,
            _ = &mut shutdown => RunStatus::Interrupted,
        };
        if status == RunStatus::Interrupted {
            warn!("Interrupted, shutting down");
            result.diagnostics.push("run interrupted".to_string());
            if let Some(mut outcome) = result.in_flight.take() {
                warn!("Scenario '{}' cut off before a verdict", outcome.name);
                outcome.error = Some("interrupted before a verdict".to_string());
                result.diagnostics.push(format!("{}: interrupted before a verdict", outcome.name));
                result.record(outcome);
            }
        }

        if let Err(e) = process.teardown().await {
            error!("Teardown failed: {}", e);
            result.diagnostics.push(format!("teardown failed: {}", e));
        }
        result.service.final_state = Some(process.state());
        result.service.terminations = process.terminations();
        if status != RunStatus::Passed {
            result.service_output = Some(process.output());
        }

        self.finish(result, status, started)
    }

    async fn drive(&self, process: &mut ServiceProcess, rng: &mut StdRng, result: &mut TestRunResult) -> RunStatus {
        match process.await_ready(&self.config.retry_policy()).await {
            Ok(attempts) => result.service.ready_after_attempts = Some(attempts),
            Err(e) => {
                error!("Service not ready: {}", e);
                result.diagnostics.push(e.to_string());
                return RunStatus::NotReady;
            }
        }

        let mut runner = ScenarioRunner::new(process.base_url(), &self.config.page);
        if self.config.screenshot_on_failure {
            runner = runner.with_screenshots(self.config.screenshot_dir());
        }

        info!("Running {} scenario(s)...", self.config.scenarios.len());
        for spec in &self.config.scenarios {
            let scenario = spec.instantiate(&self.config.profiles, rng);
            result.in_flight = Some(ScenarioOutcome::pending(&scenario));
            let outcome = self.run_scenario(&runner, &scenario).await;
            result.in_flight = None;
            let passed = outcome.passed;
            if let Some(err) = &outcome.error {
                result.diagnostics.push(format!("{}: {}", outcome.name, err));
            }
            result.record(outcome);

            // Timing-sensitive scenarios are never retried; stop at the first failure
            if !passed {
                return RunStatus::ScenarioFailed;
            }
        }
        RunStatus::Passed
    }

    /// One scenario in its own browser session
    async fn run_scenario(&self, runner: &ScenarioRunner<'_>, scenario: &Scenario) -> ScenarioOutcome {
        let start = Instant::now();
        let mut outcome = ScenarioOutcome::pending(scenario);

        let mut driver = match self.launcher.launch().await {
            Ok(driver) => driver,
            Err(e) => {
                error!("✗ {} - {}", scenario.name, e);
                outcome.error = Some(E2eError::from(e).to_string());
                outcome.duration_ms = start.elapsed().as_millis() as u64;
                return outcome;
            }
        };

        let judged = match runner.observe(driver.as_mut(), scenario).await {
            Ok(verdict) => {
                let judged = runner.judge(scenario, &verdict);
                outcome.verdict = Some(verdict);
                judged
            }
            Err(e) => Err(e),
        };

        match judged {
            Ok(()) => {
                outcome.passed = true;
                info!("✓ {} ({} ms)", scenario.name, start.elapsed().as_millis());
            }
            Err(e) => {
                error!("✗ {} - {}", scenario.name, e);
                outcome.error = Some(e.to_string());
                outcome.screenshot = runner.capture_failure(driver.as_mut(), &scenario.name).await;
            }
        }

        if let Err(e) = driver.close().await {
            warn!("Closing browser session for '{}' failed: {}", scenario.name, e);
        }
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }

    fn finish(&self, mut result: TestRunResult, status: RunStatus, started: Instant) -> TestRunResult {
        result.status = status;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            result.passed, result.failed, result.skipped, result.duration_ms
        );
        result
    }

    /// Write test results to JSON file
    pub fn write_results(&self, result: &TestRunResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::BotStrategy;
    use crate::profile::{Point, ProfileStrategy};

    fn outcome(passed: bool) -> ScenarioOutcome {
        let profile = BotStrategy::default().generate(
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            "",
            &mut StdRng::seed_from_u64(0),
        );
        let scenario = Scenario {
            name: "s".to_string(),
            profile,
            expected_success: false,
            path: "/".to_string(),
        };
        ScenarioOutcome {
            passed,
            ..ScenarioOutcome::pending(&scenario)
        }
    }

    #[test]
    fn test_record_tracks_skipped() {
        let mut result = TestRunResult::new(1, 3);
        assert_eq!(result.skipped, 3);
        result.record(outcome(true));
        result.record(outcome(false));
        assert_eq!((result.passed, result.failed, result.skipped), (1, 1, 1));
    }

    #[test]
    fn test_failure_report_ends_with_service_output() {
        let mut result = TestRunResult::new(1, 1);
        assert!(result.failure_report().is_none());
        assert_eq!(result.exit_code(), 0);

        result.status = RunStatus::ScenarioFailed;
        result.diagnostics.push("bot-linear: mismatch".to_string());
        result.service_output = Some(CapturedOutput {
            stdout: "Starting OpenSentinel server".to_string(),
            stderr: "panic".to_string(),
        });
        let report = result.failure_report().unwrap();
        assert!(report.contains("bot-linear: mismatch"));
        assert!(report.contains("SERVER OUTPUT:\nStarting OpenSentinel server"));
        assert!(report.ends_with("panic"));
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_result_serializes() {
        let mut result = TestRunResult::new(7, 1);
        result.record(outcome(true));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "passed");
        assert_eq!(json["scenarios"][0]["behavior"], "bot");
    }
}
