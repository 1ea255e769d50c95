//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the access directory, the live room registry, the mutation rate
//! limiter, and the loaded configuration.

use std::sync::Arc;

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::services::access::AccessDirectory;
use crate::services::room::RoomRegistry;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn AccessDirectory>,
    pub rooms: RoomRegistry,
    pub rate_limiter: RateLimiter,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(directory: Arc<dyn AccessDirectory>, config: Config) -> Self {
        Self {
            directory,
            rooms: RoomRegistry::new(),
            rate_limiter: RateLimiter::new(config.rate_limit),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
