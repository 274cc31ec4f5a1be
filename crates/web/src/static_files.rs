//! Static file serving
//!
//! Harness pages, the viewer build and test fixtures are served straight
//! from disk. `ServeDir` answers `Range` requests (`206`/`416`) which the
//! viewer relies on for partial fixture loads.

use axum::{
    http::{header, HeaderValue},
    Router,
};
use std::path::Path;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;

/// Router serving every file below `root`
pub fn static_router(root: &Path, cache_expiration_secs: u64) -> Router {
    let router = Router::new().fallback_service(ServeDir::new(root));

    if cache_expiration_secs == 0 {
        return router;
    }

    match HeaderValue::from_str(&format!("max-age={}", cache_expiration_secs)) {
        Ok(value) => router.layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            value,
        )),
        Err(e) => {
            warn!("Invalid cache expiration {}: {}", cache_expiration_secs, e);
            router
        }
    }
}
