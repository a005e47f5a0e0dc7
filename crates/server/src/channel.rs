//! Channels and the per-session channel set.
//!
//! A `Channel` is one physical client connection reduced to a single
//! capability: queue a `ServerMessage` for delivery. The transport owns the
//! receiving half and drains it into the socket.

use std::sync::atomic::{AtomicU64, Ordering};

use mirrorline_protocol::ServerMessage;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
#[error("channel {0} is closed")]
pub struct ChannelClosed(pub u64);

/// Sending half of one client connection (cheap to Clone).
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Channel {
    /// Create a channel and the receiver the transport drains.
    pub fn new() -> (Channel, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        (Channel { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, msg: ServerMessage) -> Result<(), ChannelClosed> {
        self.tx.send(msg).map_err(|_| ChannelClosed(self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Slot {
    channel: Channel,
    /// Diffs held back while the channel waits for its initial snapshot.
    held: Option<Vec<ServerMessage>>,
}

/// Attached channels of one session.
///
/// Broadcasting never blocks and never fails: a channel whose receiver is
/// gone is dropped from the set on the spot.
#[derive(Default)]
pub(crate) struct ChannelSet {
    slots: Mutex<Vec<Slot>>,
}

impl ChannelSet {
    /// Insert a channel that still waits for its snapshot. Broadcasts reaching
    /// it are queued until `go_live`.
    pub(crate) fn insert_priming(&self, channel: Channel) {
        let mut slots = self.slots.lock();
        slots.retain(|slot| slot.channel.id != channel.id);
        slots.push(Slot {
            channel,
            held: Some(Vec::new()),
        });
    }

    /// Deliver the snapshot, then everything held back behind it.
    pub(crate) fn go_live(&self, channel_id: u64, snapshot: ServerMessage) {
        let mut slots = self.slots.lock();
        let Some(pos) = slots.iter().position(|slot| slot.channel.id == channel_id) else {
            return;
        };

        let slot = &mut slots[pos];
        let held = slot.held.take().unwrap_or_default();
        let delivered = std::iter::once(snapshot)
            .chain(held)
            .try_for_each(|msg| slot.channel.send(msg));

        if delivered.is_err() {
            debug!(
                component = "channel",
                event = "channel.dropped",
                channel_id,
                "Channel closed before going live"
            );
            slots.remove(pos);
        }
    }

    pub(crate) fn remove(&self, channel_id: u64) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.channel.id != channel_id);
        slots.len() != before
    }

    /// Send to every attached channel; returns how many accepted it.
    pub(crate) fn broadcast(&self, msg: &ServerMessage) -> usize {
        let mut slots = self.slots.lock();
        let mut delivered = 0;
        slots.retain_mut(|slot| {
            if let Some(held) = slot.held.as_mut() {
                held.push(msg.clone());
                return true;
            }
            match slot.channel.send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(ChannelClosed(id)) => {
                    debug!(
                        component = "channel",
                        event = "channel.dropped",
                        channel_id = id,
                        "Send failed, dropping channel"
                    );
                    false
                }
            }
        });
        delivered
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn contains(&self, channel_id: u64) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|slot| slot.channel.id == channel_id)
    }
}
