//! Browser processes
//!
//! Each session owns one [`BrowserHandle`]. The production handle is a
//! spawned browser pointed at the harness page with a throwaway profile.

use crate::config::{BrowserConfig, BrowserFamily, RunMode};
use async_trait::async_trait;
use reftest_common::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Time a browser gets to exit after SIGTERM before it is killed
const GRACEFUL_EXIT: Duration = Duration::from_secs(5);

/// Preferences written into every Firefox profile
const FIREFOX_PREFS: &[(&str, &str)] = &[
    ("browser.shell.checkDefaultBrowser", "false"),
    ("browser.startup.homepage_override.mstone", "\"ignore\""),
    ("browser.tabs.warnOnClose", "false"),
    ("datareporting.policy.dataSubmissionEnabled", "false"),
    ("dom.disable_open_during_load", "false"),
    ("dom.max_script_run_time", "0"),
    ("gfx.canvas.accelerated", "false"),
    ("toolkit.telemetry.enabled", "false"),
];

/// Handle to a running browser owned by a session
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Browser name, as used for the session
    fn name(&self) -> &str;

    /// Tear the browser down. Must tolerate an already exited process.
    async fn close(&mut self) -> Result<()>;
}

/// Query parameters the in-browser runner reads on startup
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub manifest_file: String,
    pub test_filter: Vec<String>,
    pub xfa_only: bool,
    pub delay_ms: u64,
    pub master_mode: bool,
}

/// URL a browser is started with
pub fn start_url(base_url: &str, mode: RunMode, browser: &str, opts: &StartOptions) -> String {
    let mut url = format!(
        "{}{}?browser={}",
        base_url,
        mode.start_page(),
        urlencoding::encode(browser)
    );
    if !mode.is_reftest() {
        return url;
    }

    let filter = serde_json::to_string(&opts.test_filter).unwrap_or_else(|_| "[]".to_string());
    url.push_str(&format!(
        "&manifestFile={}&testFilter={}&xfaOnly={}&delay={}&masterMode={}",
        urlencoding::encode(&format!("/test/{}", opts.manifest_file)),
        urlencoding::encode(&filter),
        opts.xfa_only,
        opts.delay_ms,
        opts.master_mode
    ));
    url
}

/// Starts browsers from their configuration
#[derive(Debug, Clone, Default)]
pub struct BrowserLauncher {
    headless: bool,
}

impl BrowserLauncher {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }

    /// Command line for `cfg`, given its profile directory
    pub fn build_args(&self, cfg: &BrowserConfig, profile: &Path, url: &str) -> Vec<String> {
        let mut args = Vec::new();
        match cfg.family {
            BrowserFamily::Firefox => {
                args.push("--new-instance".to_string());
                args.push("--no-remote".to_string());
                args.push("--profile".to_string());
                args.push(profile.display().to_string());
                if self.headless {
                    args.push("--headless".to_string());
                }
            }
            BrowserFamily::Chrome => {
                args.push(format!("--user-data-dir={}", profile.display()));
                args.push("--no-first-run".to_string());
                args.push("--no-default-browser-check".to_string());
                args.push("--disable-gpu".to_string());
                args.push("--disable-popup-blocking".to_string());
                if self.headless {
                    args.push("--headless=new".to_string());
                }
            }
        }
        args.extend(cfg.extra_args.iter().cloned());
        args.push(url.to_string());
        args
    }

    /// Spawn `cfg` pointed at `url`
    pub async fn launch(&self, cfg: &BrowserConfig, url: &str) -> Result<ProcessBrowser> {
        let profile = tempfile::Builder::new()
            .prefix(&format!("reftest-{}-", cfg.name))
            .tempdir()?;
        if cfg.family == BrowserFamily::Firefox {
            write_firefox_prefs(profile.path())?;
        }

        let args = self.build_args(cfg, profile.path(), url);
        info!("Starting {} ({})", cfg.name, cfg.executable.display());
        debug!("{} {}", cfg.executable.display(), args.join(" "));

        let child = Command::new(&cfg.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Browser(format!(
                    "failed to start {} ({}): {}",
                    cfg.name,
                    cfg.executable.display(),
                    e
                ))
            })?;

        Ok(ProcessBrowser {
            name: cfg.name.clone(),
            child,
            _profile: profile,
        })
    }
}

fn write_firefox_prefs(profile: &Path) -> Result<()> {
    let prefs: String = FIREFOX_PREFS
        .iter()
        .map(|(key, value)| format!("user_pref(\"{}\", {});\n", key, value))
        .collect();
    std::fs::write(profile.join("user.js"), prefs)?;
    Ok(())
}

/// A browser running as a child process
pub struct ProcessBrowser {
    name: String,
    child: Child,
    /// Removed when the browser is dropped
    _profile: TempDir,
}

impl ProcessBrowser {
    /// Wait until the user closes the browser
    pub async fn wait_for_exit(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        debug!("{} exited with {}", self.name, status);
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[async_trait]
impl BrowserHandle for ProcessBrowser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        info!("Closing {}", self.name);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(GRACEFUL_EXIT, self.child.wait())
                        .await
                        .is_ok()
                {
                    return Ok(());
                }
            }
        }

        // Force kill if still running
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill {}: {}", self.name, e);
        }
        Ok(())
    }
}
