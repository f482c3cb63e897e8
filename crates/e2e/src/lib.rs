//! OpenSentinel behavioral verification harness
//!
//! This crate drives the OpenSentinel service end to end:
//! - Builds and spawns the service as a supervised subprocess
//! - Generates bot-like and human-like interaction profiles
//! - Replays them into a real browser through a Playwright bridge
//! - Checks that the service classifies each profile as expected
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TestSession (session.rs)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Supervisor                                                 │
//! │    ├── build() -> ()                                        │
//! │    ├── launch() -> ServiceProcess                           │
//! │    ├── await_ready(RetryPolicy) -> attempts                 │
//! │    └── teardown() (exactly once)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioSpec (TOML) -> Scenario                            │
//! │    └── ProfileStrategy: BotStrategy | HumanStrategy         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioRunner                                             │
//! │    ├── replay(profile) via dyn BrowserDriver                │
//! │    ├── observe() -> Verdict                                 │
//! │    └── judge(expected) -> VerdictMismatch?                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PlaywrightDriver (node bridge, line-delimited JSON)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod playwright;
pub mod profile;
pub mod scenario;
pub mod server;
pub mod session;
pub mod spec;

pub use config::HarnessConfig;
pub use driver::{BrowserDriver, DriverLauncher};
pub use error::{DriverError, DriverErrorKind, E2eError, E2eResult};
pub use playwright::{PlaywrightDriver, PlaywrightLauncher};
pub use profile::{Behavior, BotStrategy, HumanStrategy, InteractionEvent, InteractionProfile, Point, ProfileStrategy};
pub use scenario::{ScenarioRunner, Verdict, VerdictState};
pub use server::{Liveness, RetryPolicy, ServiceProcess, Supervisor};
pub use session::{RunStatus, TestRunResult, TestSession};
pub use spec::{Scenario, ScenarioSpec};
