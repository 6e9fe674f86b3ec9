//! Shared state for the HTTP handlers.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::channel::ChannelRegistry;

/// Everything the handlers need, wired up once at startup.
pub struct AppState {
    /// Channel catalog (name → endpoint + master key).
    pub catalog: Arc<Catalog>,
    /// Running engines, shared by HTTP subscribers.
    pub registry: Arc<ChannelRegistry>,
    /// Address advertised in playlist URLs.
    pub http_addr: String,
}
