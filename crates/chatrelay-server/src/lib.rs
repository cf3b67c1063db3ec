use std::time::Instant;

use chatrelay_core::{ChatService, ConfigStore};

mod http;

pub use http::serve;

/// Everything a request handler can reach. All of it is read-only or
/// internally synchronized, so requests stay independent of each other.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub config: ConfigStore,
    started_at: Instant,
}

impl AppState {
    pub fn new(chat: ChatService, config: ConfigStore) -> Self {
        Self {
            chat,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
