//! Driver configuration

use reftest_common::{Error, Result, DEFAULT_MANIFEST_FILE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a run does with the browsers it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Compare renderings against `ref/`
    RefTest,
    /// Compare and stage new references into `tmp/`
    Master,
    /// Run the in-browser unit test page
    UnitTest,
    /// Run the in-browser font test page
    FontTest,
}

impl RunMode {
    pub fn is_reftest(&self) -> bool {
        matches!(self, RunMode::RefTest | RunMode::Master)
    }

    pub fn is_master(&self) -> bool {
        matches!(self, RunMode::Master)
    }

    /// Harness page the browsers are pointed at
    pub fn start_page(&self) -> &'static str {
        match self {
            RunMode::RefTest | RunMode::Master => "/test/test_slave.html",
            RunMode::UnitTest => "/test/unit/unit_test.html",
            RunMode::FontTest => "/test/font/font_test.html",
        }
    }

    /// Name used in the run summary
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::RefTest | RunMode::Master => "reftest",
            RunMode::UnitTest => "unit",
            RunMode::FontTest => "font",
        }
    }
}

/// Mode selection flags as given on the command line
#[derive(Debug, Clone, Default)]
pub struct ModeFlags {
    pub master_mode: bool,
    pub reftest: bool,
    pub unit_test: bool,
    pub font_test: bool,
    pub integration: bool,
    pub xfa_only: bool,
    pub has_test_filter: bool,
    pub manifest_file: Option<String>,
}

impl ModeFlags {
    /// Reject conflicting flag combinations and pick the run mode
    pub fn validate(&self) -> Result<RunMode> {
        let selectors = [self.reftest, self.unit_test, self.font_test, self.master_mode];
        if selectors.iter().filter(|set| **set).count() > 1 {
            return Err(Error::InvalidConfig(
                "--reftest, --unit-test, --font-test, and --master-mode must not be specified together"
                    .to_string(),
            ));
        }

        let exclusive = [self.unit_test, self.font_test, self.integration, self.xfa_only];
        if exclusive.iter().filter(|set| **set).count() > 1 {
            return Err(Error::InvalidConfig(
                "--unit-test, --font-test, --integration, and --xfa-only must not be specified together"
                    .to_string(),
            ));
        }

        if self.has_test_filter && self.xfa_only {
            return Err(Error::InvalidConfig(
                "--testfilter and --xfa-only cannot be used together".to_string(),
            ));
        }

        if self.master_mode {
            if let Some(manifest) = &self.manifest_file {
                if manifest != DEFAULT_MANIFEST_FILE {
                    return Err(Error::InvalidConfig(format!(
                        "when --master-mode is specified --manifest-file shall be equal to {}",
                        DEFAULT_MANIFEST_FILE
                    )));
                }
            }
        }

        if self.integration {
            return Err(Error::InvalidConfig(
                "--integration is not supported by this driver".to_string(),
            ));
        }

        Ok(if self.master_mode {
            RunMode::Master
        } else if self.unit_test {
            RunMode::UnitTest
        } else if self.font_test {
            RunMode::FontTest
        } else {
            RunMode::RefTest
        })
    }
}

/// Browser engine family, decides the command line a browser gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserFamily {
    Firefox,
    Chrome,
}

/// One browser to run the suite in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Session name, also the `browser` field of every submission
    pub name: String,

    pub family: BrowserFamily,

    /// Executable to start, looked up in `PATH` when relative
    pub executable: PathBuf,

    /// Extra command line arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl BrowserConfig {
    pub fn firefox() -> Self {
        Self {
            name: "firefox".to_string(),
            family: BrowserFamily::Firefox,
            executable: PathBuf::from("firefox"),
            extra_args: Vec::new(),
        }
    }

    pub fn chrome() -> Self {
        Self {
            name: "chrome".to_string(),
            family: BrowserFamily::Chrome,
            executable: PathBuf::from("google-chrome"),
            extra_args: Vec::new(),
        }
    }
}

/// Web server section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory served to the browsers, the repository root
    pub root: PathBuf,
    pub host: IpAddr,
    /// 0 picks a free port
    pub port: u16,
    pub cache_expiration_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".."),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            cache_expiration_secs: 3600,
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub mode: RunMode,

    /// Directory holding the manifest, `ref/`, `tmp/` and fixtures
    pub work_dir: PathBuf,

    pub manifest_file: String,

    /// Task ids to run, empty runs everything
    pub test_filter: Vec<String>,

    /// Run tasks carrying this label
    pub label: Option<String>,

    pub xfa_only: bool,

    /// Seconds a session may stay silent before it is failed
    pub browser_timeout_secs: u64,

    pub headless: bool,

    /// Answer every prompt with yes
    pub no_prompts: bool,

    /// Open the reftest analyzer after eq failures
    pub show_ref_images: bool,

    /// Write collected per-page stats here
    pub stats_file: Option<PathBuf>,

    /// Milliseconds the runner waits before each task
    pub stats_delay_ms: u64,

    pub server: ServerConfig,

    pub browsers: Vec<BrowserConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::RefTest,
            work_dir: PathBuf::from("."),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            test_filter: Vec::new(),
            label: None,
            xfa_only: false,
            browser_timeout_secs: 120,
            headless: false,
            no_prompts: false,
            show_ref_images: false,
            stats_file: None,
            stats_delay_ms: 0,
            server: ServerConfig::default(),
            browsers: vec![BrowserConfig::firefox(), BrowserConfig::chrome()],
        }
    }
}

impl DriverConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_timeout_secs)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(&self.manifest_file)
    }

    /// Drop browsers the command line excluded
    pub fn without_browser(mut self, name: &str) -> Self {
        self.browsers.retain(|b| b.name != name);
        self
    }
}
