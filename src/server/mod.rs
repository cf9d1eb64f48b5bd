// Submodules
mod handlers;
pub mod routes;
mod runtime;
pub mod session;

pub use runtime::{serve, ServeOptions, StopSignal, Terminator};

use crate::content::Content;
use session::Session;
use std::sync::Arc;

/// Shared state handed to request handlers.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub content: Arc<Content>,
    pub stop: StopSignal,
}
