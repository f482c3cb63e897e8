//! Scenario execution: replay a profile into the live page and judge the
//! verdict the service renders

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::PageConfig;
use crate::driver::{BrowserDriver, DriverResult};
use crate::error::{E2eError, E2eResult};
use crate::profile::{InteractionEvent, InteractionProfile};
use crate::spec::Scenario;

/// Classification read back from the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictState {
    Success,
    Failure,
    Undetermined,
}

impl VerdictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictState::Success => "success",
            VerdictState::Failure => "failure",
            VerdictState::Undetermined => "undetermined",
        }
    }

    /// Text markers decide; the result element's classes break ties
    pub fn classify(text: &str, class: Option<&str>, page: &PageConfig) -> Self {
        let success = text.contains(&page.success_marker);
        let failure = text.contains(&page.failure_marker);
        match (success, failure) {
            (true, false) => return VerdictState::Success,
            (false, true) => return VerdictState::Failure,
            _ => {}
        }

        let Some(class) = class else {
            return VerdictState::Undetermined;
        };
        let tokens: Vec<&str> = class.split_whitespace().collect();
        let has_all = |selector: &str| {
            selector_classes(selector)
                .map(|wanted| wanted.iter().all(|c| tokens.contains(c)))
                .unwrap_or(false)
        };
        match (has_all(&page.success_indicator), has_all(&page.failure_indicator)) {
            (true, false) => VerdictState::Success,
            (false, true) => VerdictState::Failure,
            _ => VerdictState::Undetermined,
        }
    }
}

/// Class names of a compound class selector like `.success.visible`
fn selector_classes(selector: &str) -> Option<Vec<&str>> {
    let rest = selector.trim().strip_prefix('.')?;
    let classes: Vec<&str> = rest.split('.').collect();
    let plain = classes
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| ch.is_alphanumeric() || ch == '-' || ch == '_'));
    plain.then_some(classes)
}

/// Observed outcome of one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub state: VerdictState,
    /// Literal result text
    pub text: String,
    /// Whether a verdict indicator became visible in time
    pub indicator_seen: bool,
    pub class: Option<String>,
}

impl Verdict {
    pub fn observed_success(&self) -> Option<bool> {
        match self.state {
            VerdictState::Success => Some(true),
            VerdictState::Failure => Some(false),
            VerdictState::Undetermined => None,
        }
    }

    pub fn matches(&self, expected_success: bool) -> bool {
        self.observed_success() == Some(expected_success)
    }
}

/// File written while diagnosing a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub sha256: String,
}

/// Runs scenarios against one service instance
pub struct ScenarioRunner<'a> {
    base_url: String,
    page: &'a PageConfig,
    screenshot_dir: Option<PathBuf>,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(base_url: impl Into<String>, page: &'a PageConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page,
            screenshot_dir: None,
        }
    }

    /// Capture screenshots of failed scenarios into `dir`
    pub fn with_screenshots(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = Some(dir.into());
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Observe and judge in one go
    pub async fn run(&self, driver: &mut dyn BrowserDriver, scenario: &Scenario) -> E2eResult<Verdict> {
        let verdict = self.observe(driver, scenario).await?;
        self.judge(scenario, &verdict)?;
        Ok(verdict)
    }

    /// Navigate, replay the profile, trigger verification and read the verdict
    pub async fn observe(&self, driver: &mut dyn BrowserDriver, scenario: &Scenario) -> E2eResult<Verdict> {
        let url = self.url_for(&scenario.path);
        info!("Running scenario '{}' ({})", scenario.name, scenario.profile.behavior());

        driver.navigate(&url).await?;
        driver.wait_for_selector(&self.page.input, self.page.ready_timeout()).await?;

        debug!(
            signature = ?scenario.profile.signature(),
            "Replaying {} events over {:?}",
            scenario.profile.len(),
            scenario.profile.total_delay()
        );
        replay(driver, &scenario.profile, &self.page.input).await?;

        driver.click(&self.page.verify_button).await?;

        let either = format!("{}, {}", self.page.success_indicator, self.page.failure_indicator);
        let indicator_seen = match driver.wait_for_selector(&either, self.page.verdict_timeout()).await {
            Ok(()) => true,
            Err(e) if !e.is_timeout() => return Err(e.into()),
            Err(e) => {
                warn!("No verdict indicator within {:?} ({}), reading result anyway", self.page.verdict_timeout(), e);
                false
            }
        };

        let text = driver.read_text(&self.page.result).await?;
        let class = driver.read_attribute(&self.page.result, "class").await?;
        let text = text.trim().to_string();

        let verdict = Verdict {
            state: VerdictState::classify(&text, class.as_deref(), self.page),
            text,
            indicator_seen,
            class,
        };
        info!("Result: {}", verdict.text);
        Ok(verdict)
    }

    /// Compare the observed verdict with the expectation
    pub fn judge(&self, scenario: &Scenario, verdict: &Verdict) -> E2eResult<()> {
        if verdict.matches(scenario.expected_success) {
            if !verdict.indicator_seen {
                warn!("Scenario '{}' verdict matched but its indicator never became visible", scenario.name);
            }
            return Ok(());
        }

        Err(E2eError::VerdictMismatch {
            scenario: scenario.name.clone(),
            expected: expectation(scenario.expected_success).to_string(),
            observed: verdict.state.as_str().to_string(),
            text: verdict.text.clone(),
        })
    }

    /// Best-effort screenshot of the current page
    pub async fn capture_failure(&self, driver: &mut dyn BrowserDriver, name: &str) -> Option<Artifact> {
        let dir = self.screenshot_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Cannot create screenshot dir {}: {}", dir.display(), e);
            return None;
        }
        let path = dir.join(format!("{}.png", sanitize(name)));

        if let Err(e) = driver.screenshot(&path).await {
            warn!("Failure screenshot for '{}' not captured: {}", name, e);
            return None;
        }
        match hash_file(&path) {
            Ok(sha256) => {
                info!("Saved failure screenshot: {}", path.display());
                Some(Artifact { path, sha256 })
            }
            Err(e) => {
                warn!("Screenshot {} unreadable: {}", path.display(), e);
                None
            }
        }
    }
}

fn expectation(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Replay every event in order, honoring each declared delay
pub async fn replay(driver: &mut dyn BrowserDriver, profile: &InteractionProfile, input: &str) -> DriverResult<()> {
    let mut focused = false;

    for event in profile.events() {
        match event {
            InteractionEvent::PointerMove { x, y, delay_before } => {
                if !delay_before.is_zero() {
                    sleep(*delay_before).await;
                }
                driver.move_pointer(*x, *y).await?;
            }
            InteractionEvent::KeyPress { ch, delay_before } => {
                if !focused {
                    driver.focus(input).await?;
                    focused = true;
                }
                driver.type_char(*ch, *delay_before).await?;
            }
        }
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Hash a file using SHA256
fn hash_file(path: &Path) -> std::io::Result<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}
