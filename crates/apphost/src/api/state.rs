//! Application state shared across handlers.

use crate::auth::AuthState;
use crate::router::EventRouter;
use crate::status::StatusService;

/// Application state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Lifecycle requests and webhooks.
    pub router: EventRouter,
    /// Read-only instance views.
    pub status: StatusService,
    /// CORS settings.
    pub auth: AuthState,
}

impl AppState {
    pub fn new(router: EventRouter, status: StatusService, auth: AuthState) -> Self {
        Self {
            router,
            status,
            auth,
        }
    }
}
