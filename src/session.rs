//! Per-session context for the voice front end: the last list of alarms a
//! session was shown, so a follow-up can pick one by number.

use crate::query::AlarmQueryResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time;
use tokio::sync::RwLock;

pub type SessionId = String;

pub const DEFAULT_SESSION_TTL: time::Duration = time::Duration::from_secs(600);

pub struct Entry {
    pub born: chrono::DateTime<chrono::Utc>,
    pub expires: time::Instant,
    pub alarms: Vec<AlarmQueryResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Not found")]
    NotFound,
    #[error("Selection {selection} is not between 1 and {available}")]
    SelectionOutOfRange { selection: usize, available: usize },
}

#[derive(Default)]
pub struct Store {
    entries: RwLock<HashMap<SessionId, Arc<Entry>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the alarm list shown to `session`.
    pub async fn insert(
        &self,
        session: SessionId,
        alarms: Vec<AlarmQueryResult>,
        ttl: time::Duration,
    ) {
        let entry = Entry {
            born: chrono::Utc::now(),
            expires: time::Instant::now() + ttl,
            alarms,
        };
        self.entries.write().await.insert(session, Arc::new(entry));
    }

    pub async fn get_entry(
        &self,
        session: &str,
    ) -> Result<Arc<Entry>, SessionError> {
        let entries = self.entries.read().await;
        let entry = entries.get(session).ok_or(SessionError::NotFound)?;
        if entry.expires <= time::Instant::now() {
            return Err(SessionError::NotFound);
        }
        Ok(entry.clone())
    }

    /// Pick alarm `selection` (1-indexed) from the session's last list.
    pub async fn select(
        &self,
        session: &str,
        selection: usize,
    ) -> Result<AlarmQueryResult, SessionError> {
        let entry = self.get_entry(session).await?;
        let available = entry.alarms.len();
        selection
            .checked_sub(1)
            .and_then(|idx| entry.alarms.get(idx))
            .cloned()
            .ok_or(SessionError::SelectionOutOfRange {
                selection,
                available,
            })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop expired sessions. Returns how many were removed.
    pub async fn garbage_collect(&self) -> usize {
        let now = time::Instant::now();
        let mut entries = self.entries.write().await;
        let initial_count = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        initial_count - entries.len()
    }

    pub async fn remove(&self, session: &str) -> bool {
        self.entries.write().await.remove(session).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_util::parse_zulu;

    fn alarm(event_id: i64) -> AlarmQueryResult {
        AlarmQueryResult {
            camera_name: "FrontPorch".into(),
            event_id,
            frame_id: 1,
            event_datetime: parse_zulu("2020-01-02T00:00:00Z").unwrap(),
            storage_key: format!("archive/alerts/{event_id}.jpg"),
            local_path: None,
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = Store::new();
        assert!(store.is_empty().await);
        assert_eq!(
            store.select("nobody", 1).await.unwrap_err(),
            SessionError::NotFound
        );
    }

    #[tokio::test]
    async fn test_select_is_one_indexed() {
        let store = Store::new();
        store
            .insert("s1".into(), vec![alarm(1), alarm(2)], DEFAULT_SESSION_TTL)
            .await;
        assert_eq!(store.select("s1", 1).await.unwrap().event_id, 1);
        assert_eq!(store.select("s1", 2).await.unwrap().event_id, 2);
        assert_eq!(
            store.select("s1", 0).await.unwrap_err(),
            SessionError::SelectionOutOfRange { selection: 0, available: 2 }
        );
        assert_eq!(
            store.select("s1", 3).await.unwrap_err(),
            SessionError::SelectionOutOfRange { selection: 3, available: 2 }
        );
    }

    #[tokio::test]
    async fn test_sessions_are_independent_and_replaced() {
        let store = Store::new();
        store.insert("a".into(), vec![alarm(1)], DEFAULT_SESSION_TTL).await;
        store.insert("b".into(), vec![alarm(2)], DEFAULT_SESSION_TTL).await;
        store.insert("a".into(), vec![alarm(3)], DEFAULT_SESSION_TTL).await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.select("a", 1).await.unwrap().event_id, 3);
        assert_eq!(store.select("b", 1).await.unwrap().event_id, 2);
        assert!(store.remove("a").await);
        assert!(!store.remove("a").await);
    }

    #[tokio::test]
    async fn test_garbage_collect_expired() {
        let store = Store::new();
        store
            .insert("old".into(), vec![alarm(1)], time::Duration::from_millis(1))
            .await;
        store.insert("new".into(), vec![alarm(2)], DEFAULT_SESSION_TTL).await;
        tokio::time::sleep(time::Duration::from_millis(10)).await;
        assert_eq!(store.select("old", 1).await.unwrap_err(), SessionError::NotFound);
        assert_eq!(store.garbage_collect().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
