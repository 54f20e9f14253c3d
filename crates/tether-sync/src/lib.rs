//! Client-side synchronization layer: an in-memory query cache kept
//! consistent with a remote source of truth by optimistic mutations,
//! authoritative refetches, and a realtime event feed with bounded-backoff
//! reconnection.

pub mod actions;
pub mod cache;
pub mod client;
pub mod config;
pub mod debug;
pub mod optimistic;
pub mod realtime;
pub mod reconnect;

pub use actions::{ActionKind, ActionState, Actions};
pub use cache::{CacheEntry, QueryCache};
pub use client::SyncClient;
pub use config::{CacheTtlConfig, SyncConfig};
pub use debug::{DebugEvent, DebugEventBuffer};
pub use optimistic::{MutationCoordinator, PendingMutation};
pub use realtime::{ChannelSignal, EventPayload, RealtimeChannel, RealtimeSync};
pub use reconnect::{BackoffPolicy, ChannelPhase, SubscriptionState};
