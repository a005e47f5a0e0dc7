//! Mirrorline server engine.
//!
//! Per-user [`Session`]s own a fixed set of [`Manager`]s, mirror their
//! declared fields to every attached channel, and answer RPCs against the
//! methods each manager exposes.

pub mod channel;
mod dispatch;
pub mod error;
pub mod logging;
pub mod manager;
pub mod managers;
pub mod registry;
pub mod serial;
pub mod session;
pub mod store;
pub mod transport;

pub use channel::{Channel, ChannelClosed};
pub use error::{DispatchError, EngineError, RpcError};
pub use manager::{Args, Manager, ManagerDescriptor, Publisher, RpcMethod};
pub use registry::{SessionFactory, SessionRegistry};
pub use serial::{KeyedGate, SerialGate};
pub use session::{Session, SessionOptions, SnapshotExtension};
pub use store::{MemoryStore, SqliteStore, StateStore, StoreError};
pub use transport::router;
