use std::sync::Arc;

use agentflow_engine::LifecycleManager;

use crate::stream::SubscriberRegistry;

/// Shared application state for axum handlers.
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<SubscriberRegistry>,
}
