//! Mirrorline client
//!
//! Mirrors a user's session state locally and exposes manager methods as
//! RPC stubs. Reads never leave the process; state converges through a full
//! snapshot on every (re)connect.

mod cache;
mod connection;
mod mirror;

pub use cache::{connect, connect_with, disconnect};
pub use connection::MirrorConfig;
pub use mirror::{ManagerMirror, Member, Mirror, MirrorError, RpcStub};
