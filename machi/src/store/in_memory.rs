//! In-memory `ThreadStore`/`MessageStore`/`RunStore` implementations (spec
//! §6.2), the reference backing used by tests and by `Engine` when no
//! durable store is configured. Not suitable for multi-process deployment —
//! state lives only in this process's heap.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{Message, MessageOrder, MessageQuery, MessageStore, MessageUpdate};
use crate::run::{AgentRun, RunStore};
use crate::thread::{Pagination, Thread, ThreadFilter, ThreadStore, ThreadUpdate};

/// In-memory [`ThreadStore`]. Deleting a thread does not cascade here; the
/// cascade to messages is the caller's responsibility when wiring multiple
/// in-memory stores together (spec §6.2 "Implementations MUST cascade").
#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: RwLock<HashMap<Uuid, Thread>>,
}

impl InMemoryThreadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create(&self, thread: Thread) -> Result<Thread> {
        self.threads.write().await.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Thread>> {
        Ok(self.threads.read().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, patch: ThreadUpdate) -> Result<Thread> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(&id)
            .ok_or_else(|| AgentError::storage(format!("thread {id} not found")))?;
        if let Some(summary) = patch.summary {
            thread.summary = Some(summary);
        }
        if let Some(attributes) = patch.attributes {
            thread.attributes = attributes;
        }
        thread.touch();
        Ok(thread.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.threads.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self, filter: ThreadFilter, pagination: Pagination) -> Result<Vec<Thread>> {
        let threads = self.threads.read().await;
        let mut matched: Vec<Thread> = threads
            .values()
            .filter(|t| filter.owner_id.is_none() || filter.owner_id == t.owner_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        let offset = pagination.offset.unwrap_or(0);
        let limit = pagination.limit.unwrap_or(matched.len());
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }
}

/// In-memory [`MessageStore`], keyed by thread with append-order preserved.
#[derive(Default)]
pub struct InMemoryMessageStore {
    by_thread: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cascade-delete every message belonging to `thread_id` (spec §6.2, used
    /// by `ThreadStore::delete` callers that wire the two stores together).
    pub async fn delete_thread_messages(&self, thread_id: Uuid) {
        self.by_thread.write().await.remove(&thread_id);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add(&self, message: Message) -> Result<Message> {
        self.by_thread
            .write()
            .await
            .entry(message.thread_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn get(&self, thread_id: Uuid, query: MessageQuery) -> Result<Vec<Message>> {
        let by_thread = self.by_thread.read().await;
        let mut messages: Vec<Message> = by_thread.get(&thread_id).cloned().unwrap_or_default();

        if let Some(after) = query.after {
            messages.retain(|m| m.created_at > after);
        }
        if let Some(before) = query.before {
            messages.retain(|m| m.created_at < before);
        }

        if query.order == MessageOrder::Descending {
            messages.reverse();
        }

        if let Some(limit) = query.limit {
            messages.truncate(limit);
        }

        Ok(messages)
    }

    async fn update(&self, id: Uuid, patch: MessageUpdate) -> Result<Message> {
        let mut by_thread = self.by_thread.write().await;
        let message = by_thread
            .values_mut()
            .flatten()
            .find(|m| m.id == id)
            .ok_or_else(|| AgentError::storage(format!("message {id} not found")))?;
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(attributes) = patch.attributes {
            message.attributes = attributes;
        }
        message.touch();
        Ok(message.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut by_thread = self.by_thread.write().await;
        for messages in by_thread.values_mut() {
            messages.retain(|m| m.id != id);
        }
        Ok(())
    }
}

/// In-memory [`RunStore`].
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, AgentRun>>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: AgentRun) -> Result<AgentRun> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AgentRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update(&self, run: AgentRun) -> Result<AgentRun> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }
}

/// Bundles the three in-memory stores behind `Arc`, the shape `Engine`
/// construction expects when no durable backend is supplied.
#[must_use]
pub fn in_memory_stores() -> (Arc<InMemoryThreadStore>, Arc<InMemoryMessageStore>, Arc<InMemoryRunStore>) {
    (
        Arc::new(InMemoryThreadStore::new()),
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(InMemoryRunStore::new()),
    )
}
