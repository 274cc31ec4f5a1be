//! Web server implementation

use crate::sink::{dispatch, HarnessMessage, HarnessSink};
use crate::static_files::static_router;
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use reftest_common::{InfoMessage, QuitRequest, Result, TaskSubmission, UnitTestReport};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Largest accepted `/submit_task_results` body, snapshots are inline data URLs
const MAX_SUBMISSION_BYTES: usize = 256 * 1024 * 1024;

/// Shape of `/submit_task_results` bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Per-page rendering results
    RefTest,
    /// One pass/fail report per unit or font test
    UnitTest,
}

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    /// Directory served for every GET that is not an API route
    pub root: PathBuf,
    pub host: IpAddr,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// `Cache-Control: max-age` for static files, 0 disables the header
    pub cache_expiration_secs: u64,
    pub protocol: Protocol,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".."),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            cache_expiration_secs: 3600,
            protocol: Protocol::RefTest,
        }
    }
}

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    cfg: WebServerConfig,
    state: Arc<WebServerState>,
}

struct WebServerState {
    protocol: Protocol,
    /// Decoded requests, drained in order by a single dispatcher task
    queue: mpsc::UnboundedSender<HarnessMessage>,
}

impl WebServer {
    /// Create a new web server and start its dispatcher.
    ///
    /// Requests are acknowledged as soon as they are decoded; the sink sees
    /// them one at a time, in arrival order.
    pub fn new(cfg: WebServerConfig, sink: Arc<dyn HarnessSink>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<HarnessMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                dispatch(sink.as_ref(), message).await;
            }
            debug!("Harness dispatcher stopped");
        });

        Self {
            state: Arc::new(WebServerState {
                protocol: cfg.protocol,
                queue,
            }),
            cfg,
        }
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(
                "/submit_task_results",
                post(submit_task_results_handler)
                    .layer(DefaultBodyLimit::max(MAX_SUBMISSION_BYTES)),
            )
            .route("/info", post(info_handler))
            .route("/tellMeToQuit", post(tell_me_to_quit_handler))
            .fallback_service(static_router(
                &self.cfg.root,
                self.cfg.cache_expiration_secs,
            ))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listener and serve in the background
    pub async fn start(self) -> Result<RunningServer> {
        let addr = SocketAddr::new(self.cfg.host, self.cfg.port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!("Web server stopped with error: {}", e);
            }
        });

        info!(
            "Serving {} on http://{}",
            self.cfg.root.display(),
            local_addr
        );

        Ok(RunningServer {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle to a listening server
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL, e.g. `http://127.0.0.1:40213`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn stop(mut self) {
        info!("Stopping web server on {}", self.local_addr);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!("Web server task failed: {}", e);
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "reftest-web"
    }))
}

fn enqueue(state: &WebServerState, message: HarnessMessage) -> StatusCode {
    match state.queue.send(message) {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            warn!("Harness dispatcher is gone, dropping request");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn submit_task_results_handler(
    State(state): State<Arc<WebServerState>>,
    body: Bytes,
) -> StatusCode {
    let message = match state.protocol {
        Protocol::RefTest => serde_json::from_slice::<TaskSubmission>(&body)
            .map(HarnessMessage::TaskResult),
        Protocol::UnitTest => serde_json::from_slice::<UnitTestReport>(&body)
            .map(HarnessMessage::UnitResult),
    };

    match message {
        Ok(message) => enqueue(&state, message),
        Err(e) => {
            warn!("Malformed /submit_task_results body: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn info_handler(State(state): State<Arc<WebServerState>>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<InfoMessage>(&body) {
        Ok(info) => enqueue(&state, HarnessMessage::Info(info)),
        Err(e) => {
            warn!("Malformed /info body: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuitQuery {
    browser: Option<String>,
}

async fn tell_me_to_quit_handler(
    State(state): State<Arc<WebServerState>>,
    Query(query): Query<QuitQuery>,
    body: Bytes,
) -> StatusCode {
    // Reftest runners name the browser in the query string, unit runners in
    // the body.
    let browser = query.browser.or_else(|| {
        serde_json::from_slice::<QuitRequest>(&body)
            .ok()
            .and_then(|req| req.browser)
    });

    match browser {
        Some(browser) => enqueue(&state, HarnessMessage::Quit { browser }),
        None => {
            warn!("/tellMeToQuit without a browser name");
            StatusCode::BAD_REQUEST
        }
    }
}
