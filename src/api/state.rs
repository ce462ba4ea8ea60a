//! Shared application state for the HTTP edge (spec §6).

use std::sync::Arc;

use crate::chat::ChatProxy;
use crate::config::Settings;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub chat: Arc<ChatProxy>,
    pub settings: Arc<Settings>,
}
