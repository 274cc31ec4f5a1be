//! Browser sessions
//!
//! The [`Coordinator`] owns one [`Session`] per browser. Sessions are created
//! before their browsers start and closed exactly once, either when every
//! task has been evaluated, when the browser asks to quit, or when its
//! watchdog expires. Closing the last open session wakes the finalizer.

use crate::browser::BrowserHandle;
use crate::compare::{ComparisonEngine, RoundResults, TaskReport};
use crate::config::RunMode;
use crate::stats::StatsCollector;
use crate::supervisor::TimeoutMonitor;
use parking_lot::RwLock;
use reftest_common::{Error, Manifest, Result, SessionCounters, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Identifies a session; one per browser name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result matrix of one task within a session
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task: Task,
    /// `rounds[round][page - 1]`, pages grow as results arrive
    pub rounds: Vec<RoundResults>,
    pub evaluated: bool,
}

impl TaskState {
    fn new(task: Task) -> Self {
        let rounds = vec![Vec::new(); task.rounds];
        Self {
            task,
            rounds,
            evaluated: false,
        }
    }

    /// Results of the final round, `None` until that round starts reporting
    pub fn last_round(&self) -> Option<&[Option<reftest_common::PageResult>]> {
        self.rounds
            .last()
            .filter(|round| !round.is_empty())
            .map(Vec::as_slice)
    }

    /// Drop image payloads once evaluated. Slots stay occupied.
    pub(crate) fn release_snapshots(&mut self) {
        for result in self.rounds.iter_mut().flatten().flatten() {
            result.snapshot = None;
            result.baseline_snapshot = None;
        }
    }
}

/// Per-browser test session
pub struct Session {
    id: SessionId,
    pub(crate) browser: Option<Box<dyn BrowserHandle>>,
    closed: bool,
    pub(crate) tasks: HashMap<String, TaskState>,
    remaining: usize,
    pub(crate) counters: SessionCounters,
    pub(crate) monitor: TimeoutMonitor,
}

impl Session {
    fn new(name: &str, tasks: &[Task]) -> Self {
        Self {
            id: SessionId(name.to_string()),
            browser: None,
            closed: false,
            tasks: tasks
                .iter()
                .map(|task| (task.id.clone(), TaskState::new(task.clone())))
                .collect(),
            remaining: tasks.len(),
            counters: SessionCounters::default(),
            monitor: TimeoutMonitor::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tasks not evaluated yet
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn task(&self, id: &str) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    /// Count an evaluated task. Returns true when nothing is left to run.
    pub(crate) fn record(&mut self, report: &TaskReport) -> bool {
        report.outcome.record(&mut self.counters);
        self.counters.num_eq_no_snapshot += report.eq_no_snapshot;
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mode: RunMode,
    pub browser_timeout: Duration,
}

/// Owns all sessions of a run and everything they share
pub struct Coordinator {
    cfg: CoordinatorConfig,
    manifest: Manifest,
    pub(crate) engine: ComparisonEngine,
    pub(crate) stats: StatsCollector,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    open_sessions: AtomicUsize,
    all_closed: Notify,
    pub(crate) finalized: AtomicBool,
    weak_self: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(cfg: CoordinatorConfig, manifest: Manifest, engine: ComparisonEngine) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            cfg,
            manifest,
            engine,
            stats: StatsCollector::new(),
            sessions: RwLock::new(HashMap::new()),
            open_sessions: AtomicUsize::new(0),
            all_closed: Notify::new(),
            finalized: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn mode(&self) -> RunMode {
        self.cfg.mode
    }

    pub fn browser_timeout(&self) -> Duration {
        self.cfg.browser_timeout
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub(crate) fn weak(&self) -> Weak<Coordinator> {
        self.weak_self.clone()
    }

    /// Register a session for `name`, seeded with every manifest task.
    ///
    /// With a browser handle the session is initialized right away,
    /// otherwise [`Coordinator::attach_browser`] does it once the browser
    /// has started.
    pub fn create_session(
        &self,
        name: &str,
        browser: Option<Box<dyn BrowserHandle>>,
    ) -> Result<SessionId> {
        let mut session = Session::new(name, self.manifest.tasks());
        let id = session.id().clone();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(Error::InvalidConfig(format!(
                "browser {} is configured twice",
                name
            )));
        }
        if let Some(browser) = browser {
            session.browser = Some(browser);
            self.arm_timeout(&mut session);
        }
        sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        self.open_sessions.fetch_add(1, Ordering::SeqCst);

        debug!("Created session {} with {} tasks", name, self.manifest.len());
        Ok(id)
    }

    /// Hand a started browser to its session and start the watchdog
    pub async fn attach_browser(&self, name: &str, mut browser: Box<dyn BrowserHandle>) -> Result<()> {
        let session = self.get_session(name)?;
        {
            let mut session = session.lock().await;
            if !session.is_closed() {
                session.browser = Some(browser);
                self.arm_timeout(&mut session);
                return Ok(());
            }
        }

        warn!("Session {} closed before its browser started", name);
        browser.close().await
    }

    /// Look up the session for browser `name`
    pub fn get_session(&self, name: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(&SessionId(name.to_string()))
            .cloned()
            .ok_or_else(|| Error::UnknownSession(name.to_string()))
    }

    /// Names of all registered sessions
    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .sessions
            .read()
            .keys()
            .map(|id| id.as_str().to_string())
            .collect();
        names.sort();
        names
    }

    /// Close the session for `name`. Closing twice is a no-op.
    ///
    /// Tasks that never finished are counted as errors. The browser is torn
    /// down outside the session lock.
    pub async fn close_session(&self, name: &str) -> Result<()> {
        let session = self.get_session(name)?;
        let browser = {
            let mut session = session.lock().await;
            if session.is_closed() {
                return Ok(());
            }
            if session.remaining > 0 {
                warn!(
                    "Closing session {} with {} unfinished task(s)",
                    name, session.remaining
                );
                session.counters.num_errors += session.remaining;
                session.remaining = 0;
            }
            session.closed = true;
            session.monitor.cancel();
            session.browser.take()
        };

        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser {}: {}", name, e);
            }
        }
        info!("Session {} closed", name);

        if self.open_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("All sessions closed");
            self.all_closed.notify_one();
        }
        Ok(())
    }

    /// Close every session still open
    pub async fn close_all(&self) {
        for name in self.session_names() {
            if let Err(e) = self.close_session(&name).await {
                warn!("Failed to close session {}: {}", name, e);
            }
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Resolve once no session is open
    pub async fn wait_all_closed(&self) {
        while self.open_sessions() > 0 {
            self.all_closed.notified().await;
        }
    }

    /// Counters summed over all sessions
    pub async fn totals(&self) -> SessionCounters {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut totals = SessionCounters::default();
        for session in sessions {
            totals += session.lock().await.counters;
        }
        totals
    }
}
