//! Shared helpers for router-level tests.

use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use qrsend::content;
use qrsend::server::session::Session;
use qrsend::server::{routes, AppState, StopSignal};

pub const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    // Keeps the fixture file alive for the test's duration.
    #[allow(dead_code)]
    pub dir: TempDir,
}

impl TestApp {
    pub fn route(&self) -> String {
        format!("/{}", self.state.session.url_path())
    }
}

/// Build a router serving one fixture file as a fresh session.
pub fn create_test_app(file_name: &str, bytes: &[u8]) -> TestApp {
    let dir = TempDir::new().expect("create temp dir");
    let path: PathBuf = dir.path().join(file_name);
    std::fs::write(&path, bytes).expect("write fixture");

    let content = content::resolve(&[path], false).expect("resolve content");
    let state = AppState {
        session: Arc::new(Session::new()),
        content: Arc::new(content),
        stop: StopSignal::new(),
    };
    let app = routes::create_router(&state);

    TestApp { app, state, dir }
}

#[allow(dead_code)]
pub fn build_request(uri: &str, user_agent: Option<&str>, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(ua) = user_agent {
        builder = builder.header("User-Agent", ua);
    }
    if let Some(cookie) = cookie {
        builder = builder.header("Cookie", cookie);
    }
    builder.body(Body::empty()).expect("Failed to build request")
}
