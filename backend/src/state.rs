use std::sync::Arc;

use crate::broker::Broker;
use crate::config::Config;

// --- Shared application state ---
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<dyn Broker>,
}

impl AppState {
    pub fn new(config: Arc<Config>, broker: Arc<dyn Broker>) -> Self {
        Self { config, broker }
    }
}
