//! `notes`: an ordered note collection.
//!
//! Creation and removal write through to the store before the change becomes
//! visible; renames stay in memory until the next `persist`. All three
//! mutate the same list across an await and are therefore exclusive.

use std::sync::Arc;

use async_trait::async_trait;
use mirrorline_protocol::StateMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;
use crate::manager::{Args, Manager, ManagerDescriptor, Publisher, RpcMethod};
use crate::store::StateStore;

pub const NAME: &str = "notes";

static DESCRIPTOR: ManagerDescriptor = ManagerDescriptor::new(
    &["notes"],
    &[
        RpcMethod::exclusive("create"),
        RpcMethod::exclusive("rename"),
        RpcMethod::exclusive("remove"),
    ],
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NotesDocument {
    notes: Vec<Note>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct NotesState {
    notes: Vec<Note>,
    next_seq: u64,
    dirty: bool,
}

pub struct NotesManager {
    user_id: String,
    publisher: Publisher,
    store: Arc<dyn StateStore>,
    state: Mutex<NotesState>,
}

fn clean_title(raw: String) -> Result<String, RpcError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(RpcError::invalid_args("Title must not be empty"));
    }
    Ok(title.to_string())
}

impl NotesManager {
    pub fn new(user_id: &str, publisher: Publisher, store: Arc<dyn StateStore>) -> Self {
        Self {
            user_id: user_id.to_string(),
            publisher,
            store,
            state: Mutex::new(NotesState::default()),
        }
    }

    pub fn notes(&self) -> Vec<Note> {
        self.state.lock().notes.clone()
    }

    async fn write_through(&self, notes: Vec<Note>, next_seq: u64) -> Result<(), RpcError> {
        let doc = serde_json::to_value(NotesDocument { notes, next_seq })?;
        self.store.save(&self.user_id, NAME, doc).await?;
        Ok(())
    }

    pub async fn create(&self, title: String) -> Result<Note, RpcError> {
        let title = clean_title(title)?;
        let (note, notes, next_seq) = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let note = Note {
                id: format!("note-{}", state.next_seq),
                title,
            };
            let mut notes = state.notes.clone();
            notes.push(note.clone());
            (note, notes, state.next_seq)
        };

        self.write_through(notes, next_seq).await?;

        let mut state = self.state.lock();
        self.publisher
            .update("notes", &mut state.notes, |notes| notes.push(note.clone()));
        Ok(note)
    }

    pub async fn remove(&self, id: &str) -> Result<(), RpcError> {
        let (notes, next_seq) = {
            let state = self.state.lock();
            if !state.notes.iter().any(|n| n.id == id) {
                return Err(RpcError::new(format!("Note not found: {id}")));
            }
            let notes: Vec<Note> = state.notes.iter().filter(|n| n.id != id).cloned().collect();
            (notes, state.next_seq)
        };

        self.write_through(notes, next_seq).await?;

        let mut state = self.state.lock();
        self.publisher
            .update("notes", &mut state.notes, |notes| notes.retain(|n| n.id != id));
        Ok(())
    }

    pub fn rename(&self, id: &str, title: String) -> Result<Note, RpcError> {
        let title = clean_title(title)?;
        let mut state = self.state.lock();
        let pos = state
            .notes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| RpcError::new(format!("Note not found: {id}")))?;
        if state.notes[pos].title == title {
            return Ok(state.notes[pos].clone());
        }

        let renamed = self.publisher.update("notes", &mut state.notes, |notes| {
            notes[pos].title = title;
            notes[pos].clone()
        });
        state.dirty = true;
        Ok(renamed)
    }
}

#[async_trait]
impl Manager for NotesManager {
    fn descriptor() -> &'static ManagerDescriptor {
        &DESCRIPTOR
    }

    fn state(&self) -> StateMap {
        let mut map = StateMap::new();
        map.insert(
            "notes".into(),
            serde_json::to_value(&self.state.lock().notes).unwrap_or(Value::Array(Vec::new())),
        );
        map
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        let Some(doc) = self.store.load(&self.user_id, NAME).await? else {
            return Ok(());
        };
        let doc: NotesDocument = serde_json::from_value(doc)?;

        let mut state = self.state.lock();
        state.next_seq = doc.next_seq;
        self.publisher.assign("notes", &mut state.notes, doc.notes);
        state.dirty = false;
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let (notes, next_seq) = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            (state.notes.clone(), state.next_seq)
        };

        if let Err(e) = self.write_through(notes, next_seq).await {
            self.state.lock().dirty = true;
            return Err(anyhow::anyhow!(e));
        }
        Ok(())
    }

    async fn call(&self, method: &str, args: Args) -> Result<Value, RpcError> {
        match method {
            "create" => {
                let note = self.create(args.get(0)?).await?;
                Ok(serde_json::to_value(note)?)
            }
            "rename" => {
                let id: String = args.get(0)?;
                let note = self.rename(&id, args.get(1)?)?;
                Ok(serde_json::to_value(note)?)
            }
            "remove" => {
                let id: String = args.get(0)?;
                self.remove(&id).await?;
                Ok(json!({ "removed": id }))
            }
            other => Err(RpcError::new(format!("notes cannot handle {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn notes(store: Arc<MemoryStore>) -> NotesManager {
        NotesManager::new(
            "alice",
            Publisher::detached(NAME, NotesManager::descriptor()),
            store,
        )
    }

    #[tokio::test]
    async fn create_writes_through_and_assigns_sequential_ids() {
        let store = Arc::new(MemoryStore::new());
        let manager = notes(store.clone());

        let first = manager.create("Groceries".into()).await.unwrap();
        let second = manager.create("  Standup  ".into()).await.unwrap();
        assert_eq!(first.id, "note-1");
        assert_eq!(second.id, "note-2");
        assert_eq!(second.title, "Standup");
        assert_eq!(store.writes(), 2);

        let doc = store.peek("alice", NAME).unwrap();
        assert_eq!(doc["notes"].as_array().unwrap().len(), 2);
        assert_eq!(doc["next_seq"], json!(2));
    }

    #[tokio::test]
    async fn rename_is_batched_until_persist() {
        let store = Arc::new(MemoryStore::new());
        let manager = notes(store.clone());
        let note = manager.create("Draft".into()).await.unwrap();

        manager.rename(&note.id, "Final".into()).unwrap();
        assert_eq!(store.writes(), 1);

        manager.persist().await.unwrap();
        manager.persist().await.unwrap();
        assert_eq!(store.writes(), 2);
        assert_eq!(
            store.peek("alice", NAME).unwrap()["notes"][0]["title"],
            json!("Final")
        );
    }

    #[tokio::test]
    async fn missing_notes_and_empty_titles_are_rejected() {
        let manager = notes(Arc::new(MemoryStore::new()));
        let err = manager.remove("note-9").await.expect_err("missing note");
        assert_eq!(err.message(), "Note not found: note-9");

        let err = manager.create("   ".into()).await.expect_err("empty title");
        assert_eq!(err.code(), mirrorline_protocol::ErrorCode::InvalidArgs);
    }

    #[tokio::test]
    async fn hydrate_restores_sequence() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                "alice",
                NAME,
                json!({"notes": [{"id": "note-7", "title": "Old"}], "next_seq": 7}),
            )
            .await
            .unwrap();

        let manager = notes(store);
        manager.hydrate().await.unwrap();
        let created = manager.create("New".into()).await.unwrap();
        assert_eq!(created.id, "note-8");
        assert_eq!(manager.notes().len(), 2);
    }
}
