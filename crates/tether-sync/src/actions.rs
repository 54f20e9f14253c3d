//! Intent-level operations: each combines a remote mutation with the
//! optimistic cache work and the invalidations that keep derived entries
//! honest. Outcomes are returned to the caller as `SyncResult` values —
//! failures are observable, not merely logged — and per-action pending and
//! error state is exposed for UI surfacing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use uuid::Uuid;

use tether_core::{
    Agent, AgentBlueprint, Message, MessageRole, MutationOp, NotificationStats, QueryKey,
    QueryKind, RemoteService, SyncResult,
};

use crate::cache::QueryCache;
use crate::optimistic::MutationCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CreateAgent,
    UpdateAgent,
    DeleteAgent,
    SendMessage,
    MarkAsRead,
    MarkAllAsRead,
}

/// Observable state of one action: how many triggers are in flight and the
/// last failure, if any.
#[derive(Debug, Clone, Default)]
pub struct ActionState {
    pub pending: u32,
    pub last_error: Option<String>,
}

pub struct Actions {
    remote: Arc<dyn RemoteService>,
    cache: Arc<QueryCache>,
    coordinator: Arc<MutationCoordinator>,
    states: Mutex<HashMap<ActionKind, ActionState>>,
}

impl Actions {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        cache: Arc<QueryCache>,
        coordinator: Arc<MutationCoordinator>,
    ) -> Self {
        Self {
            remote,
            cache,
            coordinator,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<ActionKind, ActionState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, kind: ActionKind) -> ActionState {
        self.lock_states().get(&kind).cloned().unwrap_or_default()
    }

    pub fn error(&self, kind: ActionKind) -> Option<String> {
        self.state(kind).last_error
    }

    /// True while any action has a trigger in flight. Actions are not
    /// mutually exclusive in time.
    pub fn is_loading(&self) -> bool {
        self.lock_states().values().any(|state| state.pending > 0)
    }

    fn begin(&self, kind: ActionKind) {
        let mut states = self.lock_states();
        let state = states.entry(kind).or_default();
        state.pending += 1;
        state.last_error = None;
    }

    fn finish<T>(&self, kind: ActionKind, result: &SyncResult<T>) {
        let mut states = self.lock_states();
        let state = states.entry(kind).or_default();
        state.pending = state.pending.saturating_sub(1);
        if let Err(err) = result {
            state.last_error = Some(err.to_string());
            tracing::warn!(action = ?kind, error = %err, "action failed");
        }
    }

    /// Create an agent from a blueprint. The prompt is composed from the
    /// blueprint's ordered instruction fields; the new agent is visible in
    /// the list view immediately, even when that list was never fetched.
    pub async fn create_agent(
        &self,
        client_id: Uuid,
        blueprint: AgentBlueprint,
    ) -> SyncResult<Agent> {
        self.begin(ActionKind::CreateAgent);
        let result = self.create_agent_inner(client_id, blueprint).await;
        self.finish(ActionKind::CreateAgent, &result);
        result
    }

    async fn create_agent_inner(
        &self,
        client_id: Uuid,
        blueprint: AgentBlueprint,
    ) -> SyncResult<Agent> {
        let mut agent = Agent::new(client_id, blueprint.name.clone());
        agent.model = blueprint.model.clone();
        let entity = serde_json::to_value(&agent)?;
        let id = agent.id.to_string();

        self.coordinator.apply_create(
            &id,
            entity,
            QueryKey::by_id(QueryKind::AgentById, agent.id),
            vec![QueryKey::by_client(QueryKind::AgentsByClient, client_id)],
        );

        let prompt = blueprint.compose_prompt();
        let payload = json!({
            "id": id,
            "client_id": client_id,
            "name": blueprint.name,
            "model": blueprint.model,
            "prompt": prompt,
        });
        match self.remote.mutate(MutationOp::CreateAgent, payload).await {
            Ok(server) => {
                self.coordinator.confirm(&id, Some(&server));
                self.invalidate_agent_aggregates(client_id);
                Ok(serde_json::from_value(server)?)
            }
            Err(err) => {
                self.coordinator.revert(&id);
                Err(err)
            }
        }
    }

    /// Patch an agent. Both the list view and the by-id view show the patch
    /// before the remote call resolves.
    pub async fn update_agent(
        &self,
        client_id: Uuid,
        id: Uuid,
        patch: Value,
    ) -> SyncResult<Agent> {
        self.begin(ActionKind::UpdateAgent);
        let result = self.update_agent_inner(client_id, id, patch).await;
        self.finish(ActionKind::UpdateAgent, &result);
        result
    }

    async fn update_agent_inner(
        &self,
        client_id: Uuid,
        id: Uuid,
        patch: Value,
    ) -> SyncResult<Agent> {
        let entity_id = id.to_string();
        self.coordinator.apply_update(
            &entity_id,
            patch.clone(),
            QueryKey::by_id(QueryKind::AgentById, id),
            vec![QueryKey::by_client(QueryKind::AgentsByClient, client_id)],
        );

        let payload = json!({"id": entity_id, "patch": patch});
        match self.remote.mutate(MutationOp::UpdateAgent, payload).await {
            Ok(server) => {
                self.coordinator.confirm(&entity_id, Some(&server));
                Ok(serde_json::from_value(server)?)
            }
            Err(err) => {
                self.coordinator.revert(&entity_id);
                Err(err)
            }
        }
    }

    /// Delete an agent: gone from the list immediately, by-id readers
    /// refetch the authoritative absence.
    pub async fn delete_agent(&self, client_id: Uuid, id: Uuid) -> SyncResult<()> {
        self.begin(ActionKind::DeleteAgent);
        let result = self.delete_agent_inner(client_id, id).await;
        self.finish(ActionKind::DeleteAgent, &result);
        result
    }

    async fn delete_agent_inner(&self, client_id: Uuid, id: Uuid) -> SyncResult<()> {
        let entity_id = id.to_string();
        self.coordinator.apply_delete(
            &entity_id,
            QueryKey::by_id(QueryKind::AgentById, id),
            vec![QueryKey::by_client(QueryKind::AgentsByClient, client_id)],
        );

        match self
            .remote
            .mutate(MutationOp::DeleteAgent, json!({"id": entity_id}))
            .await
        {
            Ok(_) => {
                self.coordinator.confirm(&entity_id, None);
                self.invalidate_agent_aggregates(client_id);
                Ok(())
            }
            Err(err) => {
                self.coordinator.revert(&entity_id);
                Err(err)
            }
        }
    }

    /// Append a message to a conversation.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        body: impl Into<String>,
    ) -> SyncResult<Message> {
        self.begin(ActionKind::SendMessage);
        let result = self.send_message_inner(conversation_id, body.into()).await;
        self.finish(ActionKind::SendMessage, &result);
        result
    }

    async fn send_message_inner(
        &self,
        conversation_id: Uuid,
        body: String,
    ) -> SyncResult<Message> {
        let message = Message::new(conversation_id, MessageRole::User, body.clone());
        let entity = serde_json::to_value(&message)?;
        let id = message.id.to_string();

        self.coordinator.apply_append(
            &id,
            entity,
            vec![QueryKey::by_conversation(
                QueryKind::MessagesByConversation,
                conversation_id,
            )],
        );

        let payload = json!({
            "id": id,
            "conversation_id": conversation_id,
            "role": MessageRole::User,
            "body": body,
        });
        match self.remote.mutate(MutationOp::CreateMessage, payload).await {
            Ok(server) => {
                self.coordinator.confirm(&id, Some(&server));
                Ok(serde_json::from_value(server)?)
            }
            Err(err) => {
                self.coordinator.revert(&id);
                Err(err)
            }
        }
    }

    /// Mark one notification read. The unread count drops immediately; the
    /// stats aggregate is refetched once the server confirms.
    pub async fn mark_as_read(&self, client_id: Uuid, id: Uuid) -> SyncResult<()> {
        self.begin(ActionKind::MarkAsRead);
        let result = self.mark_as_read_inner(client_id, id).await;
        self.finish(ActionKind::MarkAsRead, &result);
        result
    }

    async fn mark_as_read_inner(&self, client_id: Uuid, id: Uuid) -> SyncResult<()> {
        let entity_id = id.to_string();
        let stats_key = QueryKey::by_client(QueryKind::NotificationStats, client_id);

        self.coordinator.apply_update(
            &entity_id,
            json!({"read": true}),
            QueryKey::by_id(QueryKind::NotificationById, id),
            vec![
                QueryKey::by_client(QueryKind::NotificationsByClient, client_id),
                stats_key.clone(),
            ],
        );
        self.cache.write(&stats_key, |old| {
            let mut stats: NotificationStats = serde_json::from_value(old?).ok()?;
            stats.unread = stats.unread.saturating_sub(1);
            serde_json::to_value(stats).ok()
        });

        match self
            .remote
            .mutate(MutationOp::MarkNotificationRead, json!({"id": entity_id}))
            .await
        {
            Ok(server) => {
                self.coordinator.confirm(&entity_id, Some(&server));
                self.cache.invalidate(&stats_key);
                Ok(())
            }
            Err(err) => {
                self.coordinator.revert(&entity_id);
                Err(err)
            }
        }
    }

    /// Mark every (optionally user-scoped) notification of a client read.
    /// Returns the server's count of affected notifications.
    pub async fn mark_all_as_read(
        &self,
        client_id: Uuid,
        user_id: Option<Uuid>,
    ) -> SyncResult<u64> {
        self.begin(ActionKind::MarkAllAsRead);
        let result = self.mark_all_as_read_inner(client_id, user_id).await;
        self.finish(ActionKind::MarkAllAsRead, &result);
        result
    }

    async fn mark_all_as_read_inner(
        &self,
        client_id: Uuid,
        user_id: Option<Uuid>,
    ) -> SyncResult<u64> {
        let list_key = QueryKey::by_client(QueryKind::NotificationsByClient, client_id);
        let stats_key = QueryKey::by_client(QueryKind::NotificationStats, client_id);
        let user_filter = user_id.map(|id| id.to_string());

        self.cache.write(&list_key, |old| match old {
            Some(Value::Array(items)) => Some(Value::Array(
                items
                    .into_iter()
                    .map(|mut item| {
                        let matches = match (&user_filter, item.get("user_id")) {
                            (Some(user), Some(Value::String(owner))) => owner == user,
                            (Some(_), _) => false,
                            (None, _) => true,
                        };
                        if matches {
                            if let Some(object) = item.as_object_mut() {
                                object.insert("read".into(), Value::Bool(true));
                            }
                        }
                        item
                    })
                    .collect(),
            )),
            other => other,
        });

        // Recount from the patched list; an unfetched list means the stats
        // entry cannot be corrected locally and is left for the refetch.
        let unread_left = self
            .cache
            .read(&list_key)
            .and_then(|entry| entry.value)
            .and_then(|value| {
                let items = value.as_array()?.clone();
                Some(
                    items
                        .iter()
                        .filter(|item| !item.get("read").and_then(Value::as_bool).unwrap_or(false))
                        .count() as u64,
                )
            });
        if let Some(unread) = unread_left {
            self.cache.write(&stats_key, |old| {
                let mut stats: NotificationStats = serde_json::from_value(old?).ok()?;
                stats.unread = unread;
                serde_json::to_value(stats).ok()
            });
        }

        let payload = json!({"client_id": client_id, "user_id": user_id});
        match self
            .remote
            .mutate(MutationOp::MarkAllNotificationsRead, payload)
            .await
        {
            Ok(server) => {
                self.cache.invalidate(&stats_key);
                Ok(server.get("updated").and_then(Value::as_u64).unwrap_or_default())
            }
            Err(err) => {
                self.cache.invalidate(&list_key);
                self.cache.invalidate(&stats_key);
                Err(err)
            }
        }
    }

    fn invalidate_agent_aggregates(&self, client_id: Uuid) {
        self.cache
            .invalidate(&QueryKey::by_client(QueryKind::AgentsByClient, client_id));
        self.cache
            .invalidate(&QueryKey::by_client(QueryKind::AgentStats, client_id));
    }
}
