//! Stream Sources
//!
//! One [`StreamSource`] per [`StreamKind`], each a thin adapter over the
//! collaborator that owns the underlying data.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{FederationSender, PresenceHandler, ReplicationStore};
use crate::error::Result;

use super::stream::{StreamKind, StreamRow, StreamSource};
use super::token::StreamToken;

/// Newly persisted events
pub struct EventsStream {
    store: Arc<dyn ReplicationStore>,
}

impl EventsStream {
    /// Create an events source over the store
    pub fn new(store: Arc<dyn ReplicationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StreamSource for EventsStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Events
    }

    fn current_token(&self) -> StreamToken {
        self.store.current_events_token()
    }

    async fn fetch_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.store.fetch_event_rows(from, to, limit).await
    }
}

/// Events pulled in by backfill
pub struct BackfillStream {
    store: Arc<dyn ReplicationStore>,
}

impl BackfillStream {
    /// Create a backfill source over the store
    pub fn new(store: Arc<dyn ReplicationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StreamSource for BackfillStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Backfill
    }

    fn current_token(&self) -> StreamToken {
        self.store.current_backfill_token()
    }

    async fn fetch_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.store.fetch_backfill_rows(from, to, limit).await
    }
}

/// Presence changes
///
/// The presence handler does not take a limit; the stream's fallen-behind
/// check still applies to whatever it returns.
pub struct PresenceStream {
    presence: Arc<dyn PresenceHandler>,
}

impl PresenceStream {
    /// Create a presence source over the handler
    pub fn new(presence: Arc<dyn PresenceHandler>) -> Self {
        Self { presence }
    }
}

#[async_trait]
impl StreamSource for PresenceStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Presence
    }

    fn current_token(&self) -> StreamToken {
        self.presence.current_presence_token()
    }

    async fn fetch_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        _limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.presence.fetch_presence_delta(from, to).await
    }
}

/// Outbound federation positions
pub struct FederationStream {
    sender: Arc<dyn FederationSender>,
}

impl FederationStream {
    /// Create a federation source over the sender
    pub fn new(sender: Arc<dyn FederationSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl StreamSource for FederationStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Federation
    }

    fn current_token(&self) -> StreamToken {
        self.sender.current_federation_token()
    }

    async fn fetch_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>> {
        self.sender.fetch_federation_rows(from, to, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_sources_read_their_own_log() {
        let backend = Arc::new(MemoryBackend::new());
        backend.events().append(json!(["$ev1"]));
        backend.backfill().append(json!(["$old1"]));
        backend.backfill().append(json!(["$old2"]));
        backend.presence().append(json!(["@alice:test", "online"]));

        let events = EventsStream::new(backend.clone());
        let backfill = BackfillStream::new(backend.clone());
        let presence = PresenceStream::new(backend.clone());
        let federation = FederationStream::new(backend.clone());

        assert_eq!(events.kind(), StreamKind::Events);
        assert_eq!(events.current_token(), StreamToken::new(1));
        assert_eq!(backfill.current_token(), StreamToken::new(2));
        assert_eq!(presence.current_token(), StreamToken::new(1));
        assert_eq!(federation.current_token(), StreamToken::new(0));

        let rows = backfill
            .fetch_rows(StreamToken::new(0), StreamToken::new(2), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].data, json!(["$old2"]));

        let rows = presence
            .fetch_rows(StreamToken::new(0), StreamToken::new(1), 10)
            .await
            .unwrap();
        assert_eq!(rows[0].data, json!(["@alice:test", "online"]));
    }
}
