//! Typed callbacks from the transport into the orchestrator

use async_trait::async_trait;
use reftest_common::{InfoMessage, Result, TaskSubmission, UnitTestReport};
use tracing::{error, warn};

/// One decoded request, queued in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessMessage {
    TaskResult(TaskSubmission),
    UnitResult(UnitTestReport),
    Info(InfoMessage),
    Quit { browser: String },
}

impl HarnessMessage {
    fn describe(&self) -> String {
        match self {
            HarnessMessage::TaskResult(sub) => {
                format!("result {}:{}:{}:{}", sub.browser, sub.id, sub.round, sub.page)
            }
            HarnessMessage::UnitResult(report) => format!("unit result from {}", report.browser),
            HarnessMessage::Info(_) => "info".to_string(),
            HarnessMessage::Quit { browser } => format!("quit {}", browser),
        }
    }
}

/// Receiver for harness callbacks, one method per endpoint
#[async_trait]
pub trait HarnessSink: Send + Sync {
    /// `POST /submit_task_results` in reftest mode
    async fn submit_task_results(&self, submission: TaskSubmission) -> Result<()>;

    /// `POST /submit_task_results` in unit/font test mode
    async fn submit_unit_result(&self, report: UnitTestReport) -> Result<()>;

    /// `POST /info`
    async fn info(&self, message: InfoMessage) -> Result<()>;

    /// `POST /tellMeToQuit`
    async fn tell_me_to_quit(&self, browser: &str) -> Result<()>;
}

/// Deliver one message to the sink. Errors never escape: protocol
/// violations are logged and the run continues.
pub async fn dispatch(sink: &dyn HarnessSink, message: HarnessMessage) {
    let what = message.describe();
    let result = match message {
        HarnessMessage::TaskResult(sub) => sink.submit_task_results(sub).await,
        HarnessMessage::UnitResult(report) => sink.submit_unit_result(report).await,
        HarnessMessage::Info(info) => sink.info(info).await,
        HarnessMessage::Quit { browser } => sink.tell_me_to_quit(&browser).await,
    };

    if let Err(e) = result {
        if e.is_protocol_violation() {
            warn!("Protocol violation ({}): {}", what, e);
        } else {
            error!("Failed to handle {}: {}", what, e);
        }
    }
}
