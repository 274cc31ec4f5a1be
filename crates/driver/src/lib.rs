//! Reftest Driver
//!
//! Starts the harness web server, launches one browser session per
//! configured browser, correlates the page results they post back and
//! compares them against the reference images on disk.

pub mod browser;
pub mod compare;
pub mod config;
pub mod correlator;
pub mod finalize;
pub mod runner;
pub mod session;
pub mod stats;
pub mod supervisor;

pub use browser::{BrowserHandle, BrowserLauncher, ProcessBrowser};
pub use compare::{ComparisonEngine, TaskReport};
pub use config::{BrowserConfig, DriverConfig, ModeFlags, RunMode};
pub use correlator::{is_task_done, Submitted};
pub use finalize::{AutoConfirm, Confirmation, RunSummary, StdinConfirm, Verdict};
pub use runner::TestRunner;
pub use session::{Coordinator, CoordinatorConfig, Session, SessionId};
