//! Realtime channel consumption: merge server-pushed events into the cache
//! and resubscribe with bounded backoff when the channel drops.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use tether_core::time::normalize_timestamp_fields;
use tether_core::{NotificationStats, QueryKey, QueryKind, SyncResult, TetherError};

use crate::cache::QueryCache;
use crate::debug::DebugEventBuffer;
use crate::optimistic::{MutationCoordinator, remove_from_list, upsert_in_list};
use crate::reconnect::{BackoffPolicy, ChannelPhase, SubscriptionState};

/// Timestamp fields the mapping step canonicalizes on every payload.
pub const TIMESTAMP_FIELDS: &[&str] = &["created_at", "updated_at"];

/// One server-pushed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    pub data: Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// What the channel delivers: events while connected, then a drop marker.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Event(EventPayload),
    Dropped,
}

/// The realtime transport. Implementations (websocket, SSE, test doubles)
/// deliver signals over the returned receiver; a closed receiver counts as
/// a drop.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self) -> SyncResult<mpsc::Receiver<ChannelSignal>>;
    async fn unsubscribe(&self);
}

/// Consumes a realtime channel, keeping the cache current and the
/// subscription alive within its retry budget.
pub struct RealtimeSync {
    channel: Arc<dyn RealtimeChannel>,
    cache: Arc<QueryCache>,
    coordinator: Arc<MutationCoordinator>,
    debug: Arc<DebugEventBuffer>,
    policy: BackoffPolicy,
    state: Mutex<SubscriptionState>,
    phase_tx: watch::Sender<ChannelPhase>,
}

impl RealtimeSync {
    pub fn new(
        channel_id: impl Into<String>,
        channel: Arc<dyn RealtimeChannel>,
        cache: Arc<QueryCache>,
        coordinator: Arc<MutationCoordinator>,
        debug: Arc<DebugEventBuffer>,
        policy: BackoffPolicy,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ChannelPhase::Disconnected);
        Self {
            channel,
            cache,
            coordinator,
            debug,
            policy,
            state: Mutex::new(SubscriptionState::new(channel_id)),
            phase_tx,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch the connection phase; `Exhausted` is terminal and should be
    /// surfaced as a persistent connection-lost indicator.
    pub fn phase_rx(&self) -> watch::Receiver<ChannelPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.lock_state().phase(&self.policy)
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock_state().clone()
    }

    /// Enable or disable automatic resubscription.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.lock_state().can_reconnect = enabled;
    }

    /// Disable reconnection and tear the subscription down.
    pub async fn stop(&self) {
        self.set_auto_reconnect(false);
        self.channel.unsubscribe().await;
    }

    fn publish_phase(&self) {
        let phase = self.lock_state().phase(&self.policy);
        self.phase_tx.send_replace(phase);
    }

    /// Drive the subscription until reconnection is disabled (`Ok`) or the
    /// retry budget is exhausted (`Err(ReconnectExhausted)`).
    pub async fn run(&self) -> SyncResult<()> {
        loop {
            match self.channel.subscribe().await {
                Ok(mut rx) => {
                    self.lock_state().reconnect_succeeded();
                    self.publish_phase();
                    tracing::info!(
                        channel = %self.lock_state().channel_id,
                        "realtime channel connected"
                    );

                    while let Some(signal) = rx.recv().await {
                        match signal {
                            ChannelSignal::Event(payload) => {
                                self.debug.post(payload.event.clone(), payload.data.clone());
                                if let Err(err) = self.merge_event(&payload) {
                                    tracing::warn!(
                                        event = %payload.event,
                                        error = %err,
                                        "dropping unmergeable realtime event"
                                    );
                                }
                            }
                            ChannelSignal::Dropped => break,
                        }
                    }

                    self.lock_state().connection_lost();
                    self.publish_phase();
                    tracing::warn!(
                        channel = %self.lock_state().channel_id,
                        "realtime channel dropped"
                    );
                }
                Err(err) => {
                    self.lock_state().reconnect_failed();
                    self.publish_phase();
                    tracing::warn!(error = %err, "realtime subscribe attempt failed");
                }
            }

            if !self.wait_before_retry().await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(true)` after sleeping out the backoff delay, `Ok(false)`
    /// when reconnection is disabled by policy, and `Err` once the retry
    /// budget is spent.
    async fn wait_before_retry(&self) -> SyncResult<bool> {
        let delay = {
            let mut state = self.lock_state();
            if !self
                .policy
                .may_reconnect(state.can_reconnect, state.reconnecting, state.retry_count)
            {
                if state.retry_count >= self.policy.max_retries {
                    let attempts = state.retry_count;
                    drop(state);
                    self.publish_phase();
                    tracing::error!(attempts, "reconnect budget exhausted");
                    return Err(TetherError::ReconnectExhausted { attempts });
                }
                tracing::info!("auto-reconnect disabled, leaving channel down");
                return Ok(false);
            }
            state.begin_reconnect();
            self.policy.compute_delay(state.retry_count)
        };
        self.publish_phase();
        tokio::time::sleep(delay).await;
        Ok(true)
    }

    /// Merge one server-pushed event into the cache. Timestamps are
    /// canonicalized first; a malformed timestamp rejects the event rather
    /// than coercing it.
    pub fn merge_event(&self, payload: &EventPayload) -> SyncResult<()> {
        let mut data = payload.data.clone();
        normalize_timestamp_fields(&mut data, TIMESTAMP_FIELDS)?;

        match payload.event.as_str() {
            "agent.created" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                upsert_in_list(&self.cache, &client_key(QueryKind::AgentsByClient, client_id), &data);
                self.cache
                    .write(&id_key(QueryKind::AgentById, id), |_| Some(data.clone()));
            }
            "agent.updated" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                self.coordinator.propagate(
                    id,
                    &data,
                    &[
                        id_key(QueryKind::AgentById, id),
                        client_key(QueryKind::AgentsByClient, client_id),
                    ],
                );
            }
            "agent.deleted" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                remove_from_list(&self.cache, &client_key(QueryKind::AgentsByClient, client_id), id);
                self.cache.invalidate(&id_key(QueryKind::AgentById, id));
            }
            "notification.created" => {
                let client_id = data_field(&data, "client_id")?;
                let read = data.get("read").and_then(Value::as_bool).unwrap_or(false);
                upsert_in_list(
                    &self.cache,
                    &client_key(QueryKind::NotificationsByClient, client_id),
                    &data,
                );
                self.cache
                    .write(&client_key(QueryKind::NotificationStats, client_id), |old| {
                        let mut stats: NotificationStats =
                            serde_json::from_value(old?).ok()?;
                        stats.total += 1;
                        if !read {
                            stats.unread += 1;
                        }
                        serde_json::to_value(stats).ok()
                    });
            }
            "notification.updated" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                self.coordinator.propagate(
                    id,
                    &data,
                    &[
                        id_key(QueryKind::NotificationById, id),
                        client_key(QueryKind::NotificationsByClient, client_id),
                    ],
                );
                // Read-count drift is settled by an authoritative refetch.
                self.cache
                    .invalidate(&client_key(QueryKind::NotificationStats, client_id));
            }
            "message.created" => {
                let conversation_id = data_field(&data, "conversation_id")?;
                let key = QueryKey::of(QueryKind::MessagesByConversation)
                    .param("conversation_id", conversation_id);
                upsert_in_list(&self.cache, &key, &data);
            }
            "conversation.created" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                upsert_in_list(
                    &self.cache,
                    &client_key(QueryKind::ConversationsByClient, client_id),
                    &data,
                );
                self.cache
                    .write(&id_key(QueryKind::ConversationById, id), |_| Some(data.clone()));
            }
            "conversation.updated" => {
                let id = data_field(&data, "id")?;
                let client_id = data_field(&data, "client_id")?;
                self.coordinator.propagate(
                    id,
                    &data,
                    &[
                        id_key(QueryKind::ConversationById, id),
                        client_key(QueryKind::ConversationsByClient, client_id),
                    ],
                );
            }
            other => {
                tracing::debug!(event = other, "ignoring unknown realtime event");
            }
        }

        Ok(())
    }
}

fn client_key(kind: QueryKind, client_id: &str) -> QueryKey {
    QueryKey::of(kind).param("client_id", client_id)
}

fn id_key(kind: QueryKind, id: &str) -> QueryKey {
    QueryKey::of(kind).param("id", id)
}

fn data_field<'a>(data: &'a Value, field: &str) -> SyncResult<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| TetherError::InvalidInput(format!("event payload missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Subscribe {
        Fail,
        Emit(Vec<ChannelSignal>),
    }

    struct ScriptedChannel {
        script: Mutex<VecDeque<Subscribe>>,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Subscribe>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl RealtimeChannel for ScriptedChannel {
        async fn subscribe(&self) -> SyncResult<mpsc::Receiver<ChannelSignal>> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Subscribe::Emit(signals)) => {
                    let (tx, rx) = mpsc::channel(16);
                    for signal in signals {
                        tx.send(signal).await.expect("receiver alive");
                    }
                    // Sender drops here; the stream ends after the signals.
                    Ok(rx)
                }
                Some(Subscribe::Fail) | None => Err(TetherError::SubscriptionDropped(
                    "connection refused".into(),
                )),
            }
        }

        async fn unsubscribe(&self) {}
    }

    struct Fixture {
        cache: Arc<QueryCache>,
        debug: Arc<DebugEventBuffer>,
        sync: RealtimeSync,
    }

    fn fixture(script: Vec<Subscribe>, policy: BackoffPolicy) -> Fixture {
        let cache = Arc::new(QueryCache::with_ttl(
            Duration::seconds(30),
            Duration::seconds(300),
        ));
        let coordinator = Arc::new(MutationCoordinator::new(Arc::clone(&cache)));
        let debug = Arc::new(DebugEventBuffer::default());
        let sync = RealtimeSync::new(
            "changes",
            ScriptedChannel::new(script),
            Arc::clone(&cache),
            coordinator,
            Arc::clone(&debug),
            policy,
        );
        Fixture { cache, debug, sync }
    }

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1,
            max_ms: 4,
            jitter_ms: 0,
            max_retries,
        }
    }

    fn event(name: &str, data: Value) -> ChannelSignal {
        ChannelSignal::Event(EventPayload {
            event: name.into(),
            data,
            created_at: None,
        })
    }

    #[test]
    fn merge_notification_created_appends_and_bumps_stats() {
        let fx = fixture(vec![], fast_policy(5));
        let list_key = client_key(QueryKind::NotificationsByClient, "c1");
        let stats_key = client_key(QueryKind::NotificationStats, "c1");
        fx.cache.write(&list_key, |_| Some(json!([])));
        fx.cache
            .write(&stats_key, |_| Some(json!({"total": 3, "unread": 1})));

        fx.sync
            .merge_event(&EventPayload {
                event: "notification.created".into(),
                data: json!({
                    "id": "n1",
                    "client_id": "c1",
                    "read": false,
                    "created_at": "2026-01-15T10:30:00",
                }),
                created_at: None,
            })
            .unwrap();

        let list = fx.cache.read(&list_key).unwrap().value.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        // The mapping step canonicalized the naive timestamp as UTC.
        assert_eq!(list[0]["created_at"], "2026-01-15T10:30:00+00:00");

        let stats = fx.cache.read(&stats_key).unwrap().value.unwrap();
        assert_eq!(stats, json!({"total": 4, "unread": 2}));
    }

    #[test]
    fn merge_agent_updated_patches_both_views() {
        let fx = fixture(vec![], fast_policy(5));
        let list_key = client_key(QueryKind::AgentsByClient, "c1");
        let by_id_key = id_key(QueryKind::AgentById, "a1");
        fx.cache
            .write(&list_key, |_| Some(json!([{"id": "a1", "status": "idle"}])));
        fx.cache
            .write(&by_id_key, |_| Some(json!({"id": "a1", "status": "idle"})));

        fx.sync
            .merge_event(&EventPayload {
                event: "agent.updated".into(),
                data: json!({"id": "a1", "client_id": "c1", "status": "running"}),
                created_at: None,
            })
            .unwrap();

        let list = fx.cache.read(&list_key).unwrap().value.unwrap();
        assert_eq!(list[0]["status"], "running");
        let by_id = fx.cache.read(&by_id_key).unwrap().value.unwrap();
        assert_eq!(by_id["status"], "running");
    }

    #[test]
    fn merge_agent_deleted_filters_and_invalidates() {
        let fx = fixture(vec![], fast_policy(5));
        let list_key = client_key(QueryKind::AgentsByClient, "c1");
        let by_id_key = id_key(QueryKind::AgentById, "a1");
        fx.cache.write(&list_key, |_| {
            Some(json!([{"id": "a1"}, {"id": "a2"}]))
        });
        fx.cache.write(&by_id_key, |_| Some(json!({"id": "a1"})));

        fx.sync
            .merge_event(&EventPayload {
                event: "agent.deleted".into(),
                data: json!({"id": "a1", "client_id": "c1"}),
                created_at: None,
            })
            .unwrap();

        let list = fx.cache.read(&list_key).unwrap().value.unwrap();
        assert_eq!(list, json!([{"id": "a2"}]));
        assert!(fx.cache.read(&by_id_key).unwrap().stale);
    }

    #[test]
    fn merge_rejects_malformed_timestamp() {
        let fx = fixture(vec![], fast_policy(5));
        let err = fx
            .sync
            .merge_event(&EventPayload {
                event: "notification.created".into(),
                data: json!({"id": "n1", "client_id": "c1", "created_at": "five minutes ago"}),
                created_at: None,
            })
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidTimestamp(_)));
    }

    #[test]
    fn merge_ignores_unknown_events() {
        let fx = fixture(vec![], fast_policy(5));
        fx.sync
            .merge_event(&EventPayload {
                event: "vault.sealed".into(),
                data: json!({}),
                created_at: None,
            })
            .unwrap();
        assert!(fx.cache.is_empty());
    }

    #[tokio::test]
    async fn run_merges_events_then_exhausts_after_failures() {
        let agent = json!({"id": "a1", "client_id": "c1", "status": "idle"});
        let fx = fixture(
            vec![
                Subscribe::Emit(vec![
                    event("agent.created", agent.clone()),
                    ChannelSignal::Dropped,
                ]),
                Subscribe::Fail,
                Subscribe::Fail,
            ],
            fast_policy(2),
        );

        let err = fx.sync.run().await.unwrap_err();
        assert!(matches!(err, TetherError::ReconnectExhausted { attempts: 2 }));
        assert_eq!(fx.sync.phase(), ChannelPhase::Exhausted);
        assert_eq!(*fx.sync.phase_rx().borrow(), ChannelPhase::Exhausted);

        // The event that arrived before the drop was merged and recorded.
        let by_id = fx.cache.read(&id_key(QueryKind::AgentById, "a1")).unwrap();
        assert_eq!(by_id.value.unwrap(), agent);
        assert_eq!(fx.debug.len(), 1);
    }

    #[tokio::test]
    async fn run_reconnects_and_resets_budget_after_success() {
        let fx = fixture(
            vec![
                Subscribe::Fail,
                Subscribe::Emit(vec![event(
                    "agent.created",
                    json!({"id": "a1", "client_id": "c1"}),
                )]),
                Subscribe::Fail,
                Subscribe::Fail,
            ],
            fast_policy(2),
        );

        let err = fx.sync.run().await.unwrap_err();
        // The successful middle subscription reset the retry counter, so two
        // further failures were needed to exhaust a budget of two.
        assert!(matches!(err, TetherError::ReconnectExhausted { attempts: 2 }));
        assert!(
            fx.cache
                .read(&id_key(QueryKind::AgentById, "a1"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn run_stops_quietly_when_reconnect_disabled() {
        let fx = fixture(
            vec![Subscribe::Emit(vec![ChannelSignal::Dropped])],
            fast_policy(5),
        );
        fx.sync.set_auto_reconnect(false);

        fx.sync.run().await.unwrap();
        assert_eq!(fx.sync.phase(), ChannelPhase::Disconnected);
    }
}
