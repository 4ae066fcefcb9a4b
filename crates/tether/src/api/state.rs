//! Shared application state.

use std::sync::Arc;

use crate::gateway::Gateway;
use crate::hub::EventHub;
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub store: Arc<SqliteStore>,
    pub hub: Arc<EventHub>,
}
