//! OpenSentinel E2E harness
//!
//! Builds the service, drives bot and human interaction profiles through a
//! real browser and exits non-zero when any verdict is wrong.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_e2e::playwright::Browser;
use sentinel_e2e::{HarnessConfig, PlaywrightLauncher, ScenarioSpec, TestSession};

#[derive(Parser)]
#[command(name = "sentinel-e2e")]
#[command(about = "Behavioral verification harness for the OpenSentinel service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SENTINEL_E2E_CONFIG", default_value = "sentinel-e2e.toml")]
    config: PathBuf,

    /// Service crate directory
    #[arg(long)]
    server_dir: Option<PathBuf>,

    /// Service port (0 = pick a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not build the service before launching it
    #[arg(long)]
    skip_build: bool,

    /// Browser engine (chromium, firefox, webkit)
    #[arg(short, long)]
    browser: Option<Browser>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// RNG seed for interaction profiles
    #[arg(long)]
    seed: Option<u64>,

    /// Results directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Scenario file with `[[scenarios]]` tables, replaces the configured suite
    #[arg(long)]
    scenarios: Option<PathBuf>,

    /// Only run scenarios whose name contains this pattern
    #[arg(short, long)]
    scenario: Option<String>,

    /// Enable debug logging (includes service output)
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn apply(self, config: &mut HarnessConfig) -> anyhow::Result<()> {
        if let Some(dir) = self.server_dir {
            config.server.working_dir = dir;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.skip_build {
            config.server.skip_build = true;
        }
        if let Some(browser) = self.browser {
            config.browser.browser = browser;
        }
        if self.headed {
            config.browser.headless = false;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(path) = self.scenarios {
            config.scenarios = ScenarioSpec::from_file(&path)
                .with_context(|| format!("failed to load scenarios from {}", path.display()))?;
        }
        if let Some(pattern) = self.scenario {
            let scenarios = std::mem::take(&mut config.scenarios);
            config.scenarios = ScenarioSpec::filter_by_name(scenarios, &pattern)?;
        }
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run_session(cli))
}

async fn run_session(cli: Cli) -> anyhow::Result<i32> {
    info!("OpenSentinel E2E harness v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply(&mut config)?;
    config.validate()?;

    let launcher = PlaywrightLauncher::new(config.browser.clone());
    launcher.check_installed().await?;

    let session = TestSession::new(config, Arc::new(launcher));
    let result = session.run().await;

    if let Err(e) = session.write_results(&result) {
        error!("Failed to write results: {}", e);
    }

    if let Some(report) = result.failure_report() {
        eprintln!("{}", report);
    }

    Ok(result.exit_code())
}
