//! Managers bundled with the server binary.

pub mod counter;
pub mod notes;

use std::sync::Arc;

use crate::error::EngineError;
use crate::session::{Session, SessionOptions};
use crate::store::StateStore;

pub use counter::CounterManager;
pub use notes::{Note, NotesManager};

/// Session with every bundled manager registered, backed by `store`.
pub fn standard_session(
    user_id: &str,
    store: Arc<dyn StateStore>,
    options: SessionOptions,
) -> Result<Session, EngineError> {
    let mut session = Session::with_options(user_id, options);
    let counter_store = store.clone();
    session.register_manager(counter::NAME, |publisher| {
        CounterManager::new(user_id, publisher, counter_store)
    })?;
    session.register_manager(notes::NAME, |publisher| {
        NotesManager::new(user_id, publisher, store)
    })?;
    Ok(session)
}
