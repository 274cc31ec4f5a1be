//! Run orchestration: web server, sessions, browsers, finalization

use crate::browser::{start_url, BrowserLauncher, StartOptions};
use crate::compare::ComparisonEngine;
use crate::config::{BrowserConfig, BrowserFamily, DriverConfig};
use crate::finalize::{
    check_stale_tmp, clean_previous_results, promote_references, AutoConfirm, Confirmation,
    RunSummary, StdinConfirm,
};
use crate::session::{Coordinator, CoordinatorConfig};
use reftest_common::{Error, Manifest, ManifestFilter, RefLayout, Result};
use reftest_web::{Protocol, WebServer, WebServerConfig};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Page that shows the eq log side by side with the images it names
const REFTEST_ANALYZER: &str = "/test/resources/reftest-analyzer.html#web=/test/eq.log";

/// Runs one suite in every configured browser
pub struct TestRunner {
    config: DriverConfig,
    launcher: BrowserLauncher,
    prompt: Box<dyn Confirmation>,
}

impl TestRunner {
    pub fn new(config: DriverConfig) -> Self {
        let prompt: Box<dyn Confirmation> = if config.no_prompts {
            Box::new(AutoConfirm)
        } else {
            Box::new(StdinConfirm)
        };
        Self {
            launcher: BrowserLauncher::new(config.headless),
            config,
            prompt,
        }
    }

    /// Replace how yes/no questions are answered
    pub fn with_prompt(mut self, prompt: Box<dyn Confirmation>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn layout(&self) -> RefLayout {
        RefLayout::new(&self.config.work_dir)
    }

    /// Run the suite to completion and report it
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let mode = self.config.mode;
        let layout = self.layout();

        let manifest = if mode.is_reftest() {
            self.prepare_reftest(&layout)?
        } else {
            Manifest::default()
        };

        let coordinator = Coordinator::new(
            CoordinatorConfig {
                mode,
                browser_timeout: self.config.browser_timeout(),
            },
            manifest,
            ComparisonEngine::new(layout.clone(), &self.config.work_dir),
        );

        let server = WebServer::new(
            WebServerConfig {
                root: self.config.server.root.clone(),
                host: self.config.server.host,
                port: self.config.server.port,
                cache_expiration_secs: self.config.server.cache_expiration_secs,
                protocol: if mode.is_reftest() {
                    Protocol::RefTest
                } else {
                    Protocol::UnitTest
                },
            },
            coordinator.clone(),
        )
        .start()
        .await?;
        let base_url = server.base_url();

        if let Err(e) = self.start_sessions(&coordinator, &base_url).await {
            error!("Failed to start sessions: {}", e);
            coordinator.close_all().await;
            server.stop().await;
            return Err(e);
        }

        coordinator.wait_all_closed().await;
        let summary = coordinator
            .finalize(started.elapsed())
            .await
            .ok_or_else(|| Error::Internal("run was already finalized".to_string()))?;
        summary.log();

        if let Some(path) = &self.config.stats_file {
            if let Err(e) = coordinator.stats().write(path) {
                warn!("Failed to write stats file {}: {}", path.display(), e);
            }
        }

        if summary.can_promote() {
            promote_references(&layout, self.config.no_prompts, self.prompt.as_ref())?;
        } else if self.config.show_ref_images
            && !mode.is_master()
            && summary.counters.num_eq_failures > 0
        {
            if let Err(e) = self.examine_ref_images(&base_url).await {
                warn!("Failed to open the reftest analyzer: {}", e);
            }
        }

        server.stop().await;
        Ok(summary)
    }

    /// Check the trees on disk and load the filtered manifest
    fn prepare_reftest(&self, layout: &RefLayout) -> Result<Manifest> {
        check_stale_tmp(layout, self.config.mode, self.config.no_prompts, self.prompt.as_ref())?;
        clean_previous_results(layout)?;

        let path = self.config.manifest_path();
        let manifest = Manifest::load(&path)?.filter(&ManifestFilter {
            ids: self.config.test_filter.clone(),
            label: self.config.label.clone(),
            xfa_only: self.config.xfa_only,
        })?;
        info!("Running {} task(s) from {}", manifest.len(), path.display());
        Ok(manifest)
    }

    /// Register every session, then start the browsers one by one
    async fn start_sessions(&self, coordinator: &Arc<Coordinator>, base_url: &str) -> Result<()> {
        for browser in &self.config.browsers {
            coordinator.create_session(&browser.name, None)?;
        }

        let opts = StartOptions {
            manifest_file: self.config.manifest_file.clone(),
            test_filter: self.config.test_filter.clone(),
            xfa_only: self.config.xfa_only,
            delay_ms: self.config.stats_delay_ms,
            master_mode: self.config.mode.is_master(),
        };

        for browser in &self.config.browsers {
            let url = start_url(base_url, self.config.mode, &browser.name, &opts);
            match self.launcher.launch(browser, &url).await {
                Ok(handle) => {
                    coordinator
                        .attach_browser(&browser.name, Box::new(handle))
                        .await?
                }
                Err(e) => {
                    error!("{}", e);
                    coordinator.close_session(&browser.name).await?;
                }
            }
        }
        Ok(())
    }

    /// Show the eq log in a visible browser and wait for it to be closed
    async fn examine_ref_images(&self, base_url: &str) -> Result<()> {
        let browser = self
            .config
            .browsers
            .iter()
            .find(|b| b.family == BrowserFamily::Firefox)
            .cloned()
            .unwrap_or_else(BrowserConfig::firefox);

        info!("Opening the reftest analyzer, close the browser to finish");
        let url = format!("{}{}", base_url, REFTEST_ANALYZER);
        let mut analyzer = BrowserLauncher::new(false).launch(&browser, &url).await?;
        analyzer.wait_for_exit().await
    }
}
