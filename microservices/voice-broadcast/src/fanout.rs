//! Event Fan-out (spec.md §4.H).
//!
//! Room-scoped publish/subscribe. Direct generalization of
//! `video/conference.rs`'s `ConferenceManager`, which owns a single
//! `broadcast::channel(1024)` for one conference — here keyed per room so
//! many campaigns can fan out independently, plus a fixed `global` room for
//! cross-campaign events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::CampaignStats;

const CHANNEL_CAPACITY: usize = 1024;
pub const GLOBAL_ROOM: &str = "global";

// Field names are camelCase to match the wire shape spec.md §4.H documents
// for dashboard subscribers; the `type` tag values are the literal event
// names from that same section.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "call_update", rename_all = "camelCase")]
    CallUpdate {
        broadcast_id: String,
        call_id: String,
        call_sid: Option<String>,
        phone: String,
        status: String,
        duration: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "broadcast_update", rename_all = "camelCase")]
    BroadcastUpdate {
        broadcast_id: String,
        status: String,
        stats: CampaignStats,
        active_calls: Option<usize>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "calls_created", rename_all = "camelCase")]
    CallsCreated {
        broadcast_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "stats_update", rename_all = "camelCase")]
    StatsUpdate {
        broadcast_id: String,
        stats: CampaignStats,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "broadcast_list_update", rename_all = "camelCase")]
    BroadcastListUpdate {
        timestamp: DateTime<Utc>,
    },
}

pub fn room_for(campaign_id: &str) -> String {
    format!("broadcast:{campaign_id}")
}

/// Narrow trait the Dispatch Engine and Webhook Sink depend on; they never
/// see the transport (spec.md §9 design notes).
pub trait Publisher: Send + Sync {
    fn publish(&self, room: &str, event: Event);
}

/// `DashMap<String, broadcast::Sender<Event>>` — best-effort, unordered,
/// never blocks the caller (spec.md §4.H). Sending to a room with no
/// subscribers yet lazily creates its channel; sending to one with no
/// *current* receivers is a silent drop, matching
/// `ConferenceManager`'s `let _ = self.event_tx.send(...)`.
pub struct RoomFanout {
    rooms: DashMap<String, broadcast::Sender<Event>>,
}

impl RoomFanout {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<Event> {
        self.rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Default for RoomFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for RoomFanout {
    fn publish(&self, room: &str, event: Event) {
        let sender = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let _ = sender.send(event);
    }
}
