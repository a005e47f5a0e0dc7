//! `counter`: a single synced integer.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use mirrorline_protocol::StateMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::RpcError;
use crate::manager::{Args, Manager, ManagerDescriptor, Publisher, RpcMethod};
use crate::store::StateStore;

pub const NAME: &str = "counter";

static DESCRIPTOR: ManagerDescriptor = ManagerDescriptor::new(
    &["value"],
    &[RpcMethod::shared("increment"), RpcMethod::shared("reset")],
);

#[derive(Debug, Default)]
struct CounterState {
    value: i64,
    dirty: bool,
}

pub struct CounterManager {
    user_id: String,
    publisher: Publisher,
    store: Arc<dyn StateStore>,
    state: Mutex<CounterState>,
}

impl CounterManager {
    pub fn new(user_id: &str, publisher: Publisher, store: Arc<dyn StateStore>) -> Self {
        Self {
            user_id: user_id.to_string(),
            publisher,
            store,
            state: Mutex::new(CounterState::default()),
        }
    }

    pub fn value(&self) -> i64 {
        self.state.lock().value
    }

    pub fn increment(&self, by: i64) -> i64 {
        let mut state = self.state.lock();
        let next = state.value.saturating_add(by);
        if self.publisher.assign("value", &mut state.value, next) {
            state.dirty = true;
        }
        next
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        if self.publisher.assign("value", &mut state.value, 0) {
            state.dirty = true;
        }
    }
}

#[async_trait]
impl Manager for CounterManager {
    fn descriptor() -> &'static ManagerDescriptor {
        &DESCRIPTOR
    }

    fn state(&self) -> StateMap {
        let mut map = StateMap::new();
        map.insert("value".into(), json!(self.state.lock().value));
        map
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        let Some(doc) = self.store.load(&self.user_id, NAME).await? else {
            return Ok(());
        };
        let value = doc
            .get("value")
            .and_then(Value::as_i64)
            .context("counter document has no integer `value`")?;

        let mut state = self.state.lock();
        self.publisher.assign("value", &mut state.value, value);
        state.dirty = false;
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let value = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.value
        };

        if let Err(e) = self
            .store
            .save(&self.user_id, NAME, json!({ "value": value }))
            .await
        {
            self.state.lock().dirty = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn call(&self, method: &str, args: Args) -> Result<Value, RpcError> {
        match method {
            "increment" => {
                let by = args.get_opt::<i64>(0)?.unwrap_or(1);
                Ok(json!(self.increment(by)))
            }
            "reset" => {
                self.reset();
                Ok(Value::Null)
            }
            other => Err(RpcError::new(format!("counter cannot handle {other}"))),
        }
    }
}
