use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;
use crate::query::{MutationOp, QueryKind};

/// The remote query/mutation service this layer synchronizes against.
/// Implementations live outside this workspace (HTTP, IPC, test doubles);
/// the sync layer only depends on this surface.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the authoritative value for a cache entry.
    async fn query(&self, kind: QueryKind, params: &[(String, String)]) -> SyncResult<Value>;

    /// Execute a mutation. The returned value is the server's authoritative
    /// view of the affected entity (or an operation summary).
    async fn mutate(&self, op: MutationOp, payload: Value) -> SyncResult<Value>;
}

fn _assert_remote_service_object_safe(_: &dyn RemoteService) {}
