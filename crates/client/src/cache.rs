//! Process-wide mirror cache: one transport per `(endpoint, user_id)`.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::connection::MirrorConfig;
use crate::mirror::Mirror;

type CacheKey = (String, String);

fn mirrors() -> &'static DashMap<CacheKey, Arc<Mirror>> {
    static MIRRORS: OnceLock<DashMap<CacheKey, Arc<Mirror>>> = OnceLock::new();
    MIRRORS.get_or_init(DashMap::new)
}

/// Cached mirror for `user_id` at `endpoint`, started on first use.
pub fn connect(endpoint: &str, user_id: &str) -> Arc<Mirror> {
    connect_with(endpoint, user_id, MirrorConfig::default())
}

/// Like [`connect`]; `config` only applies when a new mirror is started.
pub fn connect_with(endpoint: &str, user_id: &str, config: MirrorConfig) -> Arc<Mirror> {
    mirrors()
        .entry((endpoint.to_string(), user_id.to_string()))
        .or_insert_with(|| Mirror::spawn(endpoint, user_id, config))
        .clone()
}

/// Shut the mirror down and forget it. Returns false if none was cached.
pub fn disconnect(endpoint: &str, user_id: &str) -> bool {
    match mirrors().remove(&(endpoint.to_string(), user_id.to_string())) {
        Some((_, mirror)) => {
            mirror.shutdown();
            true
        }
        None => false,
    }
}
