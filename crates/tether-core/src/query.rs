use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cache namespaces. List-shaped kinds and their by-id counterparts are
/// independent entries; keeping them consistent is the mutation
/// coordinator's job, not the store's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    AgentsByClient,
    AgentById,
    AgentStats,
    ContactsByClient,
    ContactById,
    ConversationsByClient,
    ConversationById,
    MessagesByConversation,
    NotificationsByClient,
    NotificationById,
    NotificationStats,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentsByClient => "agents_by_client",
            Self::AgentById => "agent_by_id",
            Self::AgentStats => "agent_stats",
            Self::ContactsByClient => "contacts_by_client",
            Self::ContactById => "contact_by_id",
            Self::ConversationsByClient => "conversations_by_client",
            Self::ConversationById => "conversation_by_id",
            Self::MessagesByConversation => "messages_by_conversation",
            Self::NotificationsByClient => "notifications_by_client",
            Self::NotificationById => "notification_by_id",
            Self::NotificationStats => "notification_stats",
        }
    }
}

impl std::str::FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agents_by_client" => Ok(Self::AgentsByClient),
            "agent_by_id" => Ok(Self::AgentById),
            "agent_stats" => Ok(Self::AgentStats),
            "contacts_by_client" => Ok(Self::ContactsByClient),
            "contact_by_id" => Ok(Self::ContactById),
            "conversations_by_client" => Ok(Self::ConversationsByClient),
            "conversation_by_id" => Ok(Self::ConversationById),
            "messages_by_conversation" => Ok(Self::MessagesByConversation),
            "notifications_by_client" => Ok(Self::NotificationsByClient),
            "notification_by_id" => Ok(Self::NotificationById),
            "notification_stats" => Ok(Self::NotificationStats),
            _ => Err(format!("unknown query kind: {s}")),
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one cache entry: a kind plus an ordered parameter list.
/// Parameter order is part of the identity, so constructors keep it fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    kind: QueryKind,
    params: Vec<(String, String)>,
}

impl QueryKey {
    pub fn of(kind: QueryKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
        }
    }

    pub fn by_client(kind: QueryKind, client_id: Uuid) -> Self {
        Self::of(kind).param("client_id", client_id.to_string())
    }

    pub fn by_id(kind: QueryKind, id: Uuid) -> Self {
        Self::of(kind).param("id", id.to_string())
    }

    pub fn by_conversation(kind: QueryKind, conversation_id: Uuid) -> Self {
        Self::of(kind).param("conversation_id", conversation_id.to_string())
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for (name, value) in &self.params {
            write!(f, ":{name}={value}")?;
        }
        Ok(())
    }
}

/// Remote mutation operations the sync layer dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    CreateAgent,
    UpdateAgent,
    DeleteAgent,
    CreateMessage,
    MarkNotificationRead,
    MarkAllNotificationsRead,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAgent => "create_agent",
            Self::UpdateAgent => "update_agent",
            Self::DeleteAgent => "delete_agent",
            Self::CreateMessage => "create_message",
            Self::MarkNotificationRead => "mark_notification_read",
            Self::MarkAllNotificationsRead => "mark_all_notifications_read",
        }
    }
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips() {
        for kind in [
            QueryKind::AgentsByClient,
            QueryKind::AgentById,
            QueryKind::AgentStats,
            QueryKind::ContactsByClient,
            QueryKind::ContactById,
            QueryKind::ConversationsByClient,
            QueryKind::ConversationById,
            QueryKind::MessagesByConversation,
            QueryKind::NotificationsByClient,
            QueryKind::NotificationById,
            QueryKind::NotificationStats,
        ] {
            assert_eq!(kind.as_str().parse::<QueryKind>().unwrap(), kind);
        }
    }

    #[test]
    fn kind_rejects_unknown() {
        assert!("agents_by_region".parse::<QueryKind>().is_err());
    }

    #[test]
    fn keys_with_same_kind_and_params_are_equal() {
        let client_id = Uuid::now_v7();
        let a = QueryKey::by_client(QueryKind::AgentsByClient, client_id);
        let b = QueryKey::by_client(QueryKind::AgentsByClient, client_id);
        assert_eq!(a, b);
    }

    #[test]
    fn keys_differ_by_params() {
        let a = QueryKey::by_client(QueryKind::AgentsByClient, Uuid::now_v7());
        let b = QueryKey::by_client(QueryKind::AgentsByClient, Uuid::now_v7());
        assert_ne!(a, b);
    }

    #[test]
    fn keys_differ_by_kind() {
        let id = Uuid::now_v7();
        let a = QueryKey::by_id(QueryKind::AgentById, id);
        let b = QueryKey::by_id(QueryKind::ContactById, id);
        assert_ne!(a, b);
    }

    #[test]
    fn key_display_includes_params() {
        let id = Uuid::now_v7();
        let key = QueryKey::by_id(QueryKind::AgentById, id);
        assert_eq!(key.to_string(), format!("agent_by_id:id={id}"));
    }
}
