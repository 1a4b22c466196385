use std::sync::Arc;

use autotrade_chat::ChatService;
use autotrade_gateway::Hub;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: ChatService,
    pub hub: Hub,
    pub jwt_secret: String,
}
