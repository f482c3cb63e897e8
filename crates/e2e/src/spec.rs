//! Declarative scenario specifications

use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};
use crate::profile::{Behavior, InteractionProfile, Point, ProfileSettings};

/// One (profile class, expected verdict) pairing as written in config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Unique name for this scenario
    pub name: String,

    pub behavior: Behavior,

    /// Whether the service should accept the interaction
    pub expect_success: bool,

    /// Page path relative to the service base URL
    #[serde(default = "default_path")]
    pub path: String,

    /// Text typed into the input control
    pub text: String,

    /// Pointer span start, `[x, y]`
    #[serde(default = "default_start")]
    pub start: [f64; 2],

    /// Pointer span end, `[x, y]`
    #[serde(default = "default_end")]
    pub end: [f64; 2],
}

fn default_path() -> String {
    "/".to_string()
}

fn default_start() -> [f64; 2] {
    [100.0, 100.0]
}

fn default_end() -> [f64; 2] {
    [500.0, 500.0]
}

/// Scenario file wrapper, `[[scenarios]]` tables
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    scenarios: Vec<ScenarioSpec>,
}

impl ScenarioSpec {
    /// Bot rejected, then human accepted
    pub fn default_suite() -> Vec<Self> {
        vec![
            ScenarioSpec {
                name: "bot-linear".to_string(),
                behavior: Behavior::Bot,
                expect_success: false,
                path: default_path(),
                text: "I am a robot".to_string(),
                start: default_start(),
                end: default_end(),
            },
            ScenarioSpec {
                name: "human-noisy".to_string(),
                behavior: Behavior::Human,
                expect_success: true,
                path: default_path(),
                text: "I am a human".to_string(),
                start: default_start(),
                end: default_end(),
            },
        ]
    }

    /// Parse `[[scenarios]]` from a TOML string
    pub fn from_toml(content: &str) -> E2eResult<Vec<Self>> {
        let file: ScenarioFile = toml::from_str(content)?;
        Ok(file.scenarios)
    }

    /// Parse `[[scenarios]]` from a TOML file
    pub fn from_file(path: &Path) -> E2eResult<Vec<Self>> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Keep only scenarios whose name contains `pattern`
    pub fn filter_by_name(specs: Vec<Self>, pattern: &str) -> E2eResult<Vec<Self>> {
        let filtered: Vec<Self> = specs.into_iter().filter(|s| s.name.contains(pattern)).collect();
        if filtered.is_empty() {
            return Err(E2eError::Config(format!("no scenario matches '{}'", pattern)));
        }
        Ok(filtered)
    }

    pub fn start_point(&self) -> Point {
        Point::new(self.start[0], self.start[1])
    }

    pub fn end_point(&self) -> Point {
        Point::new(self.end[0], self.end[1])
    }

    /// Generate a fresh profile and bind it to this scenario
    pub fn instantiate(&self, profiles: &ProfileSettings, rng: &mut dyn RngCore) -> Scenario {
        let profile = self
            .behavior
            .strategy(profiles)
            .generate(self.start_point(), self.end_point(), &self.text, rng);

        Scenario {
            name: self.name.clone(),
            profile,
            expected_success: self.expect_success,
            path: self.path.clone(),
        }
    }
}

/// A scenario ready to run: generated profile plus expectation
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub profile: InteractionProfile,
    pub expected_success: bool,
    pub path: String,
}
