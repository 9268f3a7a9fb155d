//! Collaborator Traits
//!
//! The streamer does not own any data itself. It reads stream positions and
//! rows from, and forwards client commands to, the collaborators defined
//! here:
//!
//! - [`ReplicationStore`]: event and backfill rows, pusher and cache admin
//! - [`PresenceHandler`]: presence rows and per-connection sync state
//! - [`FederationSender`]: federation rows and acks (optional)
//!
//! `current_*_token` methods are synchronous: they read an in-memory
//! position and are called for every stream at the start of each poke pass.

use async_trait::async_trait;

use crate::connection::ConnectionId;
use crate::error::Result;
use crate::streaming::{StreamRow, StreamToken};

/// Storage collaborator
#[async_trait]
pub trait ReplicationStore: Send + Sync {
    /// Latest persisted event position
    fn current_events_token(&self) -> StreamToken;

    /// Event rows in `(from, to]`, at most `limit`
    async fn fetch_event_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>>;

    /// Latest backfill position
    fn current_backfill_token(&self) -> StreamToken;

    /// Backfill rows in `(from, to]`, at most `limit`
    async fn fetch_backfill_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>>;

    /// Delete a pusher on behalf of a worker
    async fn remove_pusher(&self, app_id: &str, push_key: &str, user_id: &str) -> Result<()>;

    /// Invalidate entries of a named cache
    async fn invalidate_cache(&self, cache_name: &str, keys: &[serde_json::Value]) -> Result<()>;
}

/// Presence collaborator
#[async_trait]
pub trait PresenceHandler: Send + Sync {
    /// Latest presence position
    fn current_presence_token(&self) -> StreamToken;

    /// Presence rows in `(from, to]`
    async fn fetch_presence_delta(&self, from: StreamToken, to: StreamToken)
        -> Result<Vec<StreamRow>>;

    /// A user started (`active`) or stopped syncing on a worker connection
    async fn record_sync_state(&self, conn_id: ConnectionId, user_id: &str, active: bool)
        -> Result<()>;

    /// Drop all sync state attributed to a connection
    async fn clear_sync_state(&self, conn_id: ConnectionId) -> Result<()>;
}

/// Federation sender collaborator
///
/// Only present when federation sending is delegated to a worker.
#[async_trait]
pub trait FederationSender: Send + Sync {
    /// Latest federation position
    fn current_federation_token(&self) -> StreamToken;

    /// Federation rows in `(from, to]`, at most `limit`
    async fn fetch_federation_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>>;

    /// The worker has processed federation rows up to `token`
    async fn acknowledge(&self, token: StreamToken) -> Result<()>;
}
