//! Reftest driver binary

use clap::Parser;
use reftest_driver::{DriverConfig, ModeFlags, TestRunner};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "reftest")]
#[command(about = "Run the rendering reference tests, unit tests or font tests in real browsers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "reftest.toml")]
    config: PathBuf,

    /// Run the reference tests and stage new references into tmp/
    #[arg(short, long)]
    master_mode: bool,

    /// Open the reftest analyzer when eq tests failed
    #[arg(long)]
    reftest: bool,

    /// Run the unit tests
    #[arg(long)]
    unit_test: bool,

    /// Run the font tests
    #[arg(long)]
    font_test: bool,

    /// Run the integration tests
    #[arg(long)]
    integration: bool,

    /// Manifest file, relative to the working directory
    #[arg(long)]
    manifest_file: Option<String>,

    /// Run only the task with this id (repeatable)
    #[arg(short = 't', long = "testfilter")]
    test_filter: Vec<String>,

    /// Run only tasks with XFA enabled
    #[arg(long)]
    xfa_only: bool,

    /// Skip Chrome
    #[arg(long)]
    no_chrome: bool,

    /// Skip Firefox
    #[arg(long)]
    no_firefox: bool,

    /// Answer yes to every question
    #[arg(long)]
    no_prompts: bool,

    /// Run the browsers headless
    #[arg(long)]
    headless: bool,

    /// Web server port, 0 picks a free one
    #[arg(long)]
    port: Option<u16>,

    /// Write per-page timing stats to this file
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Milliseconds to wait before each task
    #[arg(long)]
    stats_delay: Option<u64>,

    /// Seconds a browser may stay silent before its session fails
    #[arg(long)]
    browser_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn mode_flags(&self) -> ModeFlags {
        ModeFlags {
            master_mode: self.master_mode,
            reftest: self.reftest,
            unit_test: self.unit_test,
            font_test: self.font_test,
            integration: self.integration,
            xfa_only: self.xfa_only,
            has_test_filter: !self.test_filter.is_empty(),
            manifest_file: self.manifest_file.clone(),
        }
    }

    /// Command line values win over the configuration file
    fn apply(self, mut config: DriverConfig) -> DriverConfig {
        if let Some(manifest_file) = self.manifest_file {
            config.manifest_file = manifest_file;
        }
        if !self.test_filter.is_empty() {
            config.test_filter = self.test_filter;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(stats_file) = self.stats_file {
            config.stats_file = Some(stats_file);
        }
        if let Some(delay) = self.stats_delay {
            config.stats_delay_ms = delay;
        }
        if let Some(timeout) = self.browser_timeout {
            config.browser_timeout_secs = timeout;
        }
        config.xfa_only |= self.xfa_only;
        config.no_prompts |= self.no_prompts;
        config.headless |= self.headless;
        config.show_ref_images |= self.reftest;

        if self.no_chrome {
            config = config.without_browser("chrome");
        }
        if self.no_firefox {
            config = config.without_browser("firefox");
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    info!("Reftest driver v{}", reftest_common::VERSION);

    let mode = cli.mode_flags().validate()?;
    let mut config = DriverConfig::load(&cli.config)?;
    config.mode = mode;
    let config = cli.apply(config);

    let summary = TestRunner::new(config).run().await?;
    std::process::exit(summary.exit_code());
}
