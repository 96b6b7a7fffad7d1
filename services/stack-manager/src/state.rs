//! Application state shared across request handlers.

use std::sync::Arc;

use crate::stack::StackService;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    stacks: Arc<StackService>,
}

impl AppState {
    pub fn new(stacks: Arc<StackService>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { stacks }),
        }
    }

    /// The stack lifecycle service.
    pub fn stacks(&self) -> &StackService {
        &self.inner.stacks
    }
}
