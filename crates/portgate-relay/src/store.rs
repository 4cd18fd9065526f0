//! Session persistence seam
//!
//! Stores hold display-state only. The registry, not the store, is the
//! source of truth for port ownership, so a failed or stale store never
//! blocks relaying.

use crate::session::{SessionRecord, SessionStatus};
use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert a session snapshot.
    async fn persist(&self, record: SessionRecord);

    /// Sessions that were live at their last persist.
    async fn load_active(&self) -> Vec<SessionRecord>;
}

/// Keeps records in memory. The default store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: DashMap<String, SessionRecord>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn persist(&self, record: SessionRecord) {
        self.records.insert(record.id.clone(), record);
    }

    async fn load_active(&self) -> Vec<SessionRecord> {
        self.records
            .iter()
            .filter(|entry| entry.status == SessionStatus::Active)
            .map(|entry| entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use portgate_proto::Protocol;

    fn record(status_active: bool) -> SessionRecord {
        let session = Session::new(
            "alice".to_string(),
            Protocol::Http,
            "localhost".to_string(),
            3000,
            24001,
        );
        if status_active {
            session.activate();
        } else {
            session.close();
        }
        session.record()
    }

    #[tokio::test]
    async fn test_persist_and_load_active() {
        let store = InMemorySessionStore::new();
        store.persist(record(true)).await;
        store.persist(record(false)).await;

        let active = store.load_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, SessionStatus::Active);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_upserts() {
        let store = InMemorySessionStore::new();
        let session = Session::new(
            "bob".to_string(),
            Protocol::Tcp,
            "localhost".to_string(),
            5432,
            31000,
        );
        session.activate();
        store.persist(session.record()).await;
        assert_eq!(store.load_active().await.len(), 1);

        session.close();
        store.persist(session.record()).await;
        assert!(store.load_active().await.is_empty());
        assert_eq!(store.len(), 1);
    }
}
