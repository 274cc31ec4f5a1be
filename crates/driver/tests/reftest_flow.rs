//! End to end flows through the harness transport
//!
//! Results are posted to the router exactly as the in-browser runner does
//! and the coordinator behind it is inspected once its sessions closed.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use reftest_common::{encode_snapshot, Manifest, RefLayout, Task, TaskType};
use reftest_driver::finalize::{promote_references, Promotion};
use reftest_driver::{
    AutoConfirm, BrowserHandle, ComparisonEngine, Coordinator, CoordinatorConfig, RunMode, Verdict,
};
use reftest_web::{Protocol, WebServer, WebServerConfig};
use tempfile::TempDir;
use tower::ServiceExt;

const PAGE_1: &[u8] = b"\x89PNG\r\n\x1a\npage-one";
const PAGE_2: &[u8] = b"\x89PNG\r\n\x1a\npage-two";

struct FakeBrowser {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    fn name(&self) -> &str {
        "firefox"
    }

    async fn close(&mut self) -> reftest_common::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn layout(dir: &Path) -> RefLayout {
    RefLayout::new(dir).with_platform("linux")
}

fn setup(
    dir: &TempDir,
    mode: RunMode,
    protocol: Protocol,
    tasks: Vec<Task>,
) -> (Arc<Coordinator>, WebServer, Arc<AtomicUsize>) {
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            mode,
            browser_timeout: Duration::from_secs(120),
        },
        Manifest::new(tasks).unwrap(),
        ComparisonEngine::new(layout(dir.path()), dir.path()),
    );

    let closes = Arc::new(AtomicUsize::new(0));
    let browser = FakeBrowser {
        closes: closes.clone(),
    };
    coordinator
        .create_session("firefox", Some(Box::new(browser)))
        .unwrap();

    let web = WebServer::new(
        WebServerConfig {
            root: dir.path().to_path_buf(),
            protocol,
            ..Default::default()
        },
        coordinator.clone(),
    );
    (coordinator, web, closes)
}

async fn post(web: &WebServer, uri: &str, body: serde_json::Value) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    web.router().oneshot(request).await.unwrap().status()
}

fn page_result(id: &str, page: usize, last_page: usize, snapshot: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "browser": "firefox",
        "id": id,
        "round": 0,
        "page": page,
        "failure": false,
        "snapshot": encode_snapshot(snapshot),
        "viewportWidth": 612,
        "viewportHeight": 792,
        "outputScale": 1,
        "lastPageNum": last_page,
        "numberOfTasks": last_page,
    })
}

fn write_reference(dir: &Path, task: &str, page: usize, bytes: &[u8]) {
    let path = layout(dir).reference_path("firefox", task, page);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

async fn wait_closed(coordinator: &Coordinator) {
    tokio::time::timeout(Duration::from_secs(5), coordinator.wait_all_closed())
        .await
        .expect("sessions did not close");
}

#[tokio::test]
async fn test_out_of_order_pages_pass() {
    let dir = TempDir::new().unwrap();
    write_reference(dir.path(), "twopage", 1, PAGE_1);
    write_reference(dir.path(), "twopage", 2, PAGE_2);
    let (coordinator, web, closes) = setup(
        &dir,
        RunMode::RefTest,
        Protocol::RefTest,
        vec![Task::new("twopage", TaskType::Eq, "pdfs/twopage.pdf")],
    );

    let status = post(&web, "/submit_task_results", page_result("twopage", 2, 2, PAGE_2)).await;
    assert_eq!(status, StatusCode::OK);
    let status = post(&web, "/submit_task_results", page_result("twopage", 1, 2, PAGE_1)).await;
    assert_eq!(status, StatusCode::OK);

    wait_closed(&coordinator).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let summary = coordinator.finalize(Duration::from_secs(1)).await.unwrap();
    assert_eq!(summary.counters.num_runs, 1);
    assert_eq!(summary.counters.num_eq_failures, 0);
    assert_eq!(summary.verdict(), Verdict::AllPassed);
    assert_eq!(summary.exit_code(), 0);
    assert!(!layout(dir.path()).eq_log.exists());

    // The finalizer runs once
    assert!(coordinator.finalize(Duration::from_secs(1)).await.is_none());
}

#[tokio::test]
async fn test_page_reported_late_is_still_compared() {
    let dir = TempDir::new().unwrap();
    write_reference(dir.path(), "twopage", 1, PAGE_1);
    write_reference(dir.path(), "twopage", 2, PAGE_2);
    let (coordinator, web, _closes) = setup(
        &dir,
        RunMode::RefTest,
        Protocol::RefTest,
        vec![Task::new("twopage", TaskType::Eq, "pdfs/twopage.pdf")],
    );

    post(&web, "/submit_task_results", page_result("twopage", 2, 2, PAGE_2)).await;
    post(&web, "/submit_task_results", page_result("twopage", 1, 2, PAGE_2)).await;
    wait_closed(&coordinator).await;

    let summary = coordinator.finalize(Duration::ZERO).await.unwrap();
    assert_eq!(summary.counters.num_runs, 1);
    assert_eq!(summary.counters.num_eq_failures, 1);
    assert_eq!(summary.verdict(), Verdict::SomeFailed);
    assert_eq!(summary.exit_code(), 0);

    let log = std::fs::read_to_string(layout(dir.path()).eq_log).unwrap();
    assert!(log.starts_with(
        "REFTEST TEST-UNEXPECTED-FAIL | firefox-twopage-page1 | image comparison (==)\n"
    ));
    assert_eq!(log.lines().count(), 3);
}

#[tokio::test]
async fn test_master_mode_stages_new_references() {
    let dir = TempDir::new().unwrap();
    let (coordinator, web, _closes) = setup(
        &dir,
        RunMode::Master,
        Protocol::RefTest,
        vec![Task::new("fresh", TaskType::Eq, "pdfs/fresh.pdf")],
    );

    post(&web, "/submit_task_results", page_result("fresh", 1, 2, PAGE_1)).await;
    post(&web, "/submit_task_results", page_result("fresh", 2, 2, PAGE_2)).await;
    wait_closed(&coordinator).await;

    let summary = coordinator.finalize(Duration::ZERO).await.unwrap();
    assert_eq!(summary.counters.num_eq_failures, 0);
    assert_eq!(summary.counters.num_eq_no_snapshot, 2);
    assert!(summary.can_promote());

    let layout = layout(dir.path());
    assert_eq!(std::fs::read(layout.staged_path("firefox", "fresh", 1)).unwrap(), PAGE_1);
    assert_eq!(std::fs::read(layout.staged_path("firefox", "fresh", 2)).unwrap(), PAGE_2);

    let promotion = promote_references(&layout, true, &AutoConfirm).unwrap();
    assert_eq!(
        promotion,
        Promotion::Promoted {
            files: 2,
            tmp_removed: false
        }
    );
    assert_eq!(std::fs::read(layout.reference_path("firefox", "fresh", 2)).unwrap(), PAGE_2);
}

#[tokio::test]
async fn test_protocol_violations_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let (coordinator, web, closes) = setup(
        &dir,
        RunMode::RefTest,
        Protocol::RefTest,
        vec![
            Task::new("a", TaskType::Load, "pdfs/a.pdf"),
            Task::new("b", TaskType::Load, "pdfs/b.pdf"),
        ],
    );

    let mut stranger = page_result("a", 1, 1, PAGE_1);
    stranger["browser"] = serde_json::json!("safari");
    assert_eq!(post(&web, "/submit_task_results", stranger).await, StatusCode::OK);
    assert_eq!(
        post(&web, "/submit_task_results", page_result("nope", 1, 1, PAGE_1)).await,
        StatusCode::OK
    );
    post(&web, "/submit_task_results", page_result("a", 1, 1, PAGE_1)).await;
    post(&web, "/submit_task_results", page_result("a", 1, 1, PAGE_1)).await;
    post(&web, "/info", serde_json::json!({"message": "halfway"})).await;
    post(&web, "/tellMeToQuit?browser=firefox", serde_json::json!({})).await;

    wait_closed(&coordinator).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // "b" never reported
    let summary = coordinator.finalize(Duration::ZERO).await.unwrap();
    assert_eq!(summary.counters.num_runs, 1);
    assert_eq!(summary.counters.num_errors, 1);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_unit_test_reports() {
    let dir = TempDir::new().unwrap();
    let (coordinator, web, _closes) = setup(&dir, RunMode::UnitTest, Protocol::UnitTest, vec![]);

    for (status, description) in [
        ("TEST-PASSED", "primitives"),
        ("TEST-UNEXPECTED-FAIL", "cff_parser"),
    ] {
        let report = serde_json::json!({
            "browser": "firefox",
            "status": status,
            "description": description,
            "error": null,
        });
        assert_eq!(post(&web, "/submit_task_results", report).await, StatusCode::OK);
    }
    post(&web, "/tellMeToQuit", serde_json::json!({"browser": "firefox"})).await;

    wait_closed(&coordinator).await;
    let summary = coordinator.finalize(Duration::ZERO).await.unwrap();
    assert_eq!(summary.counters.num_runs, 2);
    assert_eq!(summary.counters.num_errors, 1);
    assert_eq!(summary.verdict(), Verdict::SomeFailed);
    assert_eq!(summary.report_lines()[0], "Run 2 tests");
}
