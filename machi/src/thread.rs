//! Threads: the durable conversation a run executes against (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// A conversation thread. Owns its messages; a sub-thread created by the
/// delegation tool (§4.8) is a distinct `Thread` whose messages never bleed
/// into the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub attributes: Value,
    pub summary: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Thread {
    #[must_use]
    pub fn new(owner_id: Option<String>) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            attributes: Value::Null,
            summary: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}

/// Filter options for `ThreadStore::list`.
#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub owner_id: Option<String>,
}

/// Pagination options shared by `list`/`get` style queries.
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Patch applied by `ThreadStore::update`.
#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    pub summary: Option<String>,
    pub attributes: Option<Value>,
}

/// Persistence contract for threads (spec §6.2).
#[async_trait::async_trait]
pub trait ThreadStore: Send + Sync {
    async fn create(&self, thread: Thread) -> crate::error::Result<Thread>;
    async fn get(&self, id: Uuid) -> crate::error::Result<Option<Thread>>;
    async fn update(&self, id: Uuid, patch: ThreadUpdate) -> crate::error::Result<Thread>;
    /// Deletes the thread. Implementations MUST cascade-delete its messages.
    async fn delete(&self, id: Uuid) -> crate::error::Result<()>;
    async fn list(
        &self,
        filter: ThreadFilter,
        pagination: Pagination,
    ) -> crate::error::Result<Vec<Thread>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_has_no_summary() {
        let thread = Thread::new(Some("user-1".to_string()));
        assert!(thread.summary.is_none());
        assert_eq!(thread.created_at, thread.updated_at);
    }
}
