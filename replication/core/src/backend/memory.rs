//! In-Memory Backend
//!
//! Implements every collaborator trait over plain in-memory logs. Used by the
//! daemon when no external storage is attached, and by tests, which also use
//! it to observe what the streamer forwarded (sync state, acks, pusher
//! removals, cache invalidations) and to inject fetch failures.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::error::{ReplicationError, Result};
use crate::streaming::{StreamRow, StreamToken};

use super::traits::{FederationSender, PresenceHandler, ReplicationStore};

/// One append-only stream log
#[derive(Debug)]
pub struct MemoryLog {
    name: &'static str,
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    rows: Vec<StreamRow>,
    current: StreamToken,
    failing: bool,
}

impl MemoryLog {
    /// Create an empty log at token 0
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Append one row under a fresh token
    pub fn append(&self, data: serde_json::Value) -> StreamToken {
        self.append_batch(vec![data])
    }

    /// Append several rows sharing one fresh token
    pub fn append_batch(&self, rows: Vec<serde_json::Value>) -> StreamToken {
        let mut inner = self.inner.lock();
        let token = inner.current.next();
        inner.current = token;
        inner
            .rows
            .extend(rows.into_iter().map(|data| StreamRow::new(token, data)));
        token
    }

    /// Latest appended token
    #[must_use]
    pub fn current_token(&self) -> StreamToken {
        self.inner.lock().current
    }

    /// Number of rows stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Whether the log has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent fetches fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Rows in `(from, to]`, at most `limit`
    ///
    /// # Errors
    ///
    /// Returns a collaborator error while failure injection is on.
    pub fn fetch(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        let inner = self.inner.lock();
        if inner.failing {
            return Err(ReplicationError::collaborator(
                self.name,
                "fetch failed (injected)",
            ));
        }

        Ok(inner
            .rows
            .iter()
            .filter(|row| row.token > from && row.token <= to)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// A pusher removal forwarded by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedPusher {
    /// Application id
    pub app_id: String,
    /// Push key
    pub push_key: String,
    /// Owning user
    pub user_id: String,
}

/// In-memory implementation of all collaborators
#[derive(Debug)]
pub struct MemoryBackend {
    events: MemoryLog,
    backfill: MemoryLog,
    presence: MemoryLog,
    federation: MemoryLog,
    syncing: Mutex<HashMap<ConnectionId, BTreeSet<String>>>,
    sync_clears: Mutex<HashMap<ConnectionId, usize>>,
    federation_acks: Mutex<Vec<StreamToken>>,
    removed_pushers: Mutex<Vec<RemovedPusher>>,
    invalidations: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend with four empty logs
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: MemoryLog::new("events store"),
            backfill: MemoryLog::new("backfill store"),
            presence: MemoryLog::new("presence"),
            federation: MemoryLog::new("federation sender"),
            syncing: Mutex::new(HashMap::new()),
            sync_clears: Mutex::new(HashMap::new()),
            federation_acks: Mutex::new(Vec::new()),
            removed_pushers: Mutex::new(Vec::new()),
            invalidations: Mutex::new(Vec::new()),
        }
    }

    /// Events log
    #[must_use]
    pub fn events(&self) -> &MemoryLog {
        &self.events
    }

    /// Backfill log
    #[must_use]
    pub fn backfill(&self) -> &MemoryLog {
        &self.backfill
    }

    /// Presence log
    #[must_use]
    pub fn presence(&self) -> &MemoryLog {
        &self.presence
    }

    /// Federation log
    #[must_use]
    pub fn federation(&self) -> &MemoryLog {
        &self.federation
    }

    /// Users currently syncing through a connection, sorted
    #[must_use]
    pub fn syncing_users(&self, conn_id: ConnectionId) -> Vec<String> {
        self.syncing
            .lock()
            .get(&conn_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How many times sync state was cleared for a connection
    #[must_use]
    pub fn sync_clear_count(&self, conn_id: ConnectionId) -> usize {
        self.sync_clears.lock().get(&conn_id).copied().unwrap_or(0)
    }

    /// Federation acks received, in order
    #[must_use]
    pub fn federation_acks(&self) -> Vec<StreamToken> {
        self.federation_acks.lock().clone()
    }

    /// Pusher removals received, in order
    #[must_use]
    pub fn removed_pushers(&self) -> Vec<RemovedPusher> {
        self.removed_pushers.lock().clone()
    }

    /// Cache invalidations received, in order
    #[must_use]
    pub fn cache_invalidations(&self) -> Vec<(String, Vec<serde_json::Value>)> {
        self.invalidations.lock().clone()
    }
}

#[async_trait]
impl ReplicationStore for MemoryBackend {
    fn current_events_token(&self) -> StreamToken {
        self.events.current_token()
    }

    async fn fetch_event_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.events.fetch(from, to, limit)
    }

    fn current_backfill_token(&self) -> StreamToken {
        self.backfill.current_token()
    }

    async fn fetch_backfill_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.backfill.fetch(from, to, limit)
    }

    async fn remove_pusher(&self, app_id: &str, push_key: &str, user_id: &str) -> Result<()> {
        self.removed_pushers.lock().push(RemovedPusher {
            app_id: app_id.to_string(),
            push_key: push_key.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn invalidate_cache(&self, cache_name: &str, keys: &[serde_json::Value]) -> Result<()> {
        self.invalidations
            .lock()
            .push((cache_name.to_string(), keys.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl PresenceHandler for MemoryBackend {
    fn current_presence_token(&self) -> StreamToken {
        self.presence.current_token()
    }

    async fn fetch_presence_delta(
        &self,
        from: StreamToken,
        to: StreamToken,
    ) -> Result<Vec<StreamRow>> {
        self.presence.fetch(from, to, usize::MAX)
    }

    async fn record_sync_state(
        &self,
        conn_id: ConnectionId,
        user_id: &str,
        active: bool,
    ) -> Result<()> {
        let mut syncing = self.syncing.lock();
        let users = syncing.entry(conn_id).or_default();
        if active {
            users.insert(user_id.to_string());
        } else {
            users.remove(user_id);
        }
        Ok(())
    }

    async fn clear_sync_state(&self, conn_id: ConnectionId) -> Result<()> {
        self.syncing.lock().remove(&conn_id);
        *self.sync_clears.lock().entry(conn_id).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait]
impl FederationSender for MemoryBackend {
    fn current_federation_token(&self) -> StreamToken {
        self.federation.current_token()
    }

    async fn fetch_federation_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.federation.fetch(from, to, limit)
    }

    async fn acknowledge(&self, token: StreamToken) -> Result<()> {
        self.federation_acks.lock().push(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_append_assigns_tokens() {
        let log = MemoryLog::new("test");
        assert!(log.is_empty());
        assert_eq!(log.append(json!(1)), StreamToken::new(1));
        assert_eq!(
            log.append_batch(vec![json!(2), json!(3)]),
            StreamToken::new(2)
        );
        assert_eq!(log.current_token(), StreamToken::new(2));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_log_fetch_window_and_limit() {
        let log = MemoryLog::new("test");
        for i in 0..5 {
            log.append(json!(i));
        }

        let rows = log
            .fetch(StreamToken::new(1), StreamToken::new(4), 10)
            .unwrap();
        let tokens: Vec<i64> = rows.iter().map(|r| r.token.as_i64()).collect();
        assert_eq!(tokens, vec![2, 3, 4]);

        let rows = log
            .fetch(StreamToken::new(0), StreamToken::new(5), 2)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_log_failure_injection() {
        let log = MemoryLog::new("test");
        log.append(json!(1));
        log.set_failing(true);
        assert!(log
            .fetch(StreamToken::new(0), StreamToken::new(1), 10)
            .is_err());
        log.set_failing(false);
        assert!(log
            .fetch(StreamToken::new(0), StreamToken::new(1), 10)
            .is_ok());
    }

    #[tokio::test]
    async fn test_sync_state_tracking() {
        let backend = MemoryBackend::new();
        let conn = ConnectionId::new();

        backend.record_sync_state(conn, "@bob:test", true).await.unwrap();
        backend.record_sync_state(conn, "@alice:test", true).await.unwrap();
        assert_eq!(
            backend.syncing_users(conn),
            vec!["@alice:test".to_string(), "@bob:test".to_string()]
        );

        backend.record_sync_state(conn, "@bob:test", false).await.unwrap();
        assert_eq!(backend.syncing_users(conn), vec!["@alice:test".to_string()]);

        backend.clear_sync_state(conn).await.unwrap();
        assert!(backend.syncing_users(conn).is_empty());
        assert_eq!(backend.sync_clear_count(conn), 1);
    }
}
