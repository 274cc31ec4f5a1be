//! Browser timeout supervision
//!
//! Every reftest session has a watchdog that is re-armed whenever its
//! browser submits a result. A browser that stays silent past the bound has
//! all of its outstanding tasks counted as errors and its session closed.

use crate::session::{Coordinator, Session};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Abortable single-shot timer
#[derive(Debug, Default)]
pub struct TimeoutMonitor {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimeoutMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer and schedule `on_expiry` after `after`.
    ///
    /// `on_expiry` receives the generation of this arming so a late firing
    /// can tell it has been superseded.
    pub fn arm<F, Fut>(&mut self, after: Duration, on_expiry: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let expiry = on_expiry(self.generation);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            expiry.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the pending timer without aborting it. Used by the timer task
    /// itself so the close it performs is not cut short.
    pub fn detach(&mut self) {
        self.handle = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `generation` is the arming still pending
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_armed() && self.generation == generation
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Coordinator {
    /// (Re)start the watchdog of `session`. Unit and font runs have none.
    pub(crate) fn arm_timeout(&self, session: &mut Session) {
        if !self.mode().is_reftest() || session.is_closed() {
            return;
        }
        let timeout = self.browser_timeout();
        let coordinator = self.weak();
        let name = session.name().to_string();
        session.monitor.arm(timeout, move |generation| async move {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.handle_timeout(&name, generation).await;
            }
        });
    }

    /// Watchdog expiry for `name`
    pub(crate) async fn handle_timeout(&self, name: &str, generation: u64) {
        let Ok(session) = self.get_session(name) else {
            return;
        };
        {
            let mut session = session.lock().await;
            if session.is_closed() || !session.monitor.is_current(generation) {
                debug!("Stale timeout for {} ignored", name);
                return;
            }
            error!(
                "TEST-UNEXPECTED-FAIL | test failed {} has not responded in {}s",
                name,
                self.browser_timeout().as_secs()
            );
            session.monitor.detach();
        }

        // Outstanding tasks are charged as errors by the close
        if let Err(e) = self.close_session(name).await {
            warn!("Failed to close timed out session {}: {}", name, e);
        }
    }
}
