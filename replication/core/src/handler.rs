//! Protocol Handler
//!
//! Applies inbound worker commands to one connection. The transport reads
//! lines and hands them here in order; a returned error means the
//! connection must be sent `ERROR` and closed.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::Result;
use crate::streaming::StartToken;
use crate::streamer::Streamer;
use crate::transport::{ClientCommand, StreamSelector};

/// Command dispatcher for one connection
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    streamer: Arc<Streamer>,
    conn: Arc<Connection>,
}

impl ProtocolHandler {
    /// Create a handler for a registered connection
    #[must_use]
    pub fn new(streamer: Arc<Streamer>, conn: Arc<Connection>) -> Self {
        Self { streamer, conn }
    }

    /// The connection this handler serves
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Parse and apply one line
    ///
    /// Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Any protocol, stream or collaborator error. The caller closes the
    /// connection.
    pub async fn handle_line(&self, line: &str) -> Result<()> {
        self.conn.touch(chrono::Utc::now().timestamp_millis());

        match ClientCommand::parse(line)? {
            Some(command) => self.handle_command(command).await,
            None => Ok(()),
        }
    }

    /// Apply one parsed command
    ///
    /// # Errors
    ///
    /// See [`Self::handle_line`].
    pub async fn handle_command(&self, command: ClientCommand) -> Result<()> {
        tracing::trace!(conn_id = %self.conn.id(), command = command.name(), "Received command");

        match command {
            ClientCommand::Name(name) => {
                tracing::info!(conn_id = %self.conn.id(), name = %name, "Connection named");
                self.conn.set_name(name);
                Ok(())
            }
            ClientCommand::Replicate { stream, token } => match stream {
                StreamSelector::All => {
                    for kind in self.streamer.stream_kinds() {
                        self.subscribe_to_stream(kind.name(), token).await?;
                    }
                    Ok(())
                }
                StreamSelector::Named(name) => self.subscribe_to_stream(&name, token).await,
            },
            ClientCommand::Ping(_) => {
                self.conn.record_ping(chrono::Utc::now().timestamp_millis());
                Ok(())
            }
            ClientCommand::UserSync { state, user_id } => {
                self.streamer
                    .on_user_sync(self.conn.id(), &user_id, state.is_active())
                    .await
            }
            ClientCommand::FederationAck(token) => self.streamer.federation_ack(token).await,
            ClientCommand::RemovePusher {
                app_id,
                user_id,
                push_key,
            } => {
                self.streamer
                    .on_remove_pusher(&app_id, &push_key, &user_id)
                    .await
            }
            ClientCommand::InvalidateCache { cache_name, keys } => {
                self.streamer.on_invalidate_cache(&cache_name, &keys).await
            }
        }
    }

    /// Catch a stream up from `token` and switch it to steady state
    ///
    /// # Errors
    ///
    /// `UnknownStream` if the stream is not registered, otherwise whatever
    /// the catch-up fetch or the final sends fail with. On error the stream
    /// is left unsubscribed and no `POSITION` has been sent.
    pub async fn subscribe_to_stream(&self, stream_name: &str, token: StartToken) -> Result<()> {
        let kind = self.streamer.stream(stream_name)?.kind();
        tracing::info!(
            conn_id = %self.conn.id(),
            stream = stream_name,
            %token,
            "Subscribing to stream"
        );

        self.conn.begin_subscribe(kind);

        match self.streamer.get_stream_updates(stream_name, token).await {
            Ok((history, position)) => {
                let rows = history.len();
                self.conn.finish_subscribe(kind, history, position)?;
                tracing::debug!(
                    conn_id = %self.conn.id(),
                    stream = stream_name,
                    rows,
                    %position,
                    "Stream caught up"
                );
                Ok(())
            }
            Err(e) => {
                self.conn.fail_subscribe(kind);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::connection::{OutboundReceiver, SubscriptionState};
    use crate::error::{ProtocolError, ReplicationError};
    use crate::notifier::Notifier;
    use crate::streamer::{Collaborators, StreamerConfig};
    use crate::streaming::{StreamKind, StreamToken};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create_test_handler(
        config: StreamerConfig,
    ) -> (ProtocolHandler, OutboundReceiver, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let collaborators =
            Collaborators::in_memory(Arc::clone(&backend), Arc::new(Notifier::new()));
        let streamer = Arc::new(Streamer::new(config, collaborators));
        let (conn, mut rx) = streamer.new_connection(None);
        drain(&mut rx);
        (ProtocolHandler::new(streamer, conn), rx, backend)
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(command) = rx.try_recv() {
            lines.push(command.to_line());
        }
        lines
    }

    #[tokio::test]
    async fn test_name_and_ping() {
        let (handler, mut rx, _) = create_test_handler(StreamerConfig::default());

        handler.handle_line("NAME synchrotron").await.unwrap();
        handler.handle_line("PING 1490197665618").await.unwrap();
        handler.handle_line("").await.unwrap();

        assert_eq!(handler.connection().name(), Some("synchrotron".to_string()));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_replicate_now_sends_position_only() {
        let (handler, mut rx, backend) = create_test_handler(StreamerConfig::default());
        backend.events().append(json!(["$a"]));
        handler.streamer.on_notifier_poke().await;

        handler.handle_line("REPLICATE events NOW").await.unwrap();

        assert_eq!(drain(&mut rx), vec!["POSITION events 1"]);
        assert_eq!(
            handler.connection().subscription_state(StreamKind::Events),
            SubscriptionState::Replicating
        );
    }

    #[tokio::test]
    async fn test_replicate_from_token_sends_history() {
        let (handler, mut rx, backend) = create_test_handler(StreamerConfig::default());
        backend
            .backfill()
            .append_batch(vec![json!(["$a"]), json!(["$b"])]);
        backend.backfill().append(json!(["$c"]));
        handler.streamer.on_notifier_poke().await;

        handler.handle_line("REPLICATE backfill 0").await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                r#"RDATA backfill _ ["$a"]"#,
                r#"RDATA backfill 1 ["$b"]"#,
                r#"RDATA backfill 2 ["$c"]"#,
                "POSITION backfill 2",
            ]
        );
    }

    #[tokio::test]
    async fn test_replicate_all() {
        let (handler, mut rx, _) = create_test_handler(StreamerConfig::default());

        handler.handle_line("REPLICATE ALL NOW").await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                "POSITION events 0",
                "POSITION backfill 0",
                "POSITION presence 0",
                "POSITION federation 0",
            ]
        );
        assert_eq!(handler.connection().replicating_streams(), StreamKind::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_replicate_unknown_stream() {
        let (handler, mut rx, _) = create_test_handler(StreamerConfig {
            send_federation: true,
            ..StreamerConfig::default()
        });

        let err = handler
            .handle_line("REPLICATE federation NOW")
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicationError::UnknownStream(ref name) if name == "federation"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_replicate_fallen_behind_leaves_unsubscribed() {
        let (handler, mut rx, backend) = create_test_handler(StreamerConfig {
            max_behind: 2,
            ..StreamerConfig::default()
        });
        backend.events().append(json!([1]));
        backend.events().append(json!([2]));
        handler.streamer.on_notifier_poke().await;

        let err = handler.handle_line("REPLICATE events 0").await.unwrap_err();

        assert!(matches!(err, ReplicationError::FallenBehind { .. }));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            handler.connection().subscription_state(StreamKind::Events),
            SubscriptionState::Unsubscribed
        );
    }

    #[tokio::test]
    async fn test_user_sync_forwarded_with_conn_id() {
        let (handler, _rx, backend) = create_test_handler(StreamerConfig::default());
        let conn_id = handler.connection().id();

        handler.handle_line("USER_SYNC start @alice:test").await.unwrap();
        assert_eq!(backend.syncing_users(conn_id), vec!["@alice:test".to_string()]);

        handler.handle_line("USER_SYNC end @alice:test").await.unwrap();
        assert!(backend.syncing_users(conn_id).is_empty());
    }

    #[tokio::test]
    async fn test_admin_commands_forwarded() {
        let (handler, _rx, backend) = create_test_handler(StreamerConfig::default());

        handler.handle_line("FEDERATION_ACK 4").await.unwrap();
        handler
            .handle_line("REMOVE_PUSHER m.http @bob:test pushkey")
            .await
            .unwrap();
        handler
            .handle_line(r#"INVALIDATE_CACHE get_user ["@bob:test"]"#)
            .await
            .unwrap();

        assert_eq!(backend.federation_acks(), vec![StreamToken::new(4)]);
        let removed = backend.removed_pushers();
        assert_eq!(removed[0].app_id, "m.http");
        assert_eq!(removed[0].user_id, "@bob:test");
        assert_eq!(removed[0].push_key, "pushkey");
        assert_eq!(backend.cache_invalidations().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_lines_are_protocol_errors() {
        let (handler, _rx, _) = create_test_handler(StreamerConfig::default());

        for line in ["FOO bar", "USER_SYNC idle @alice:test", "REPLICATE events"] {
            let err = handler.handle_line(line).await.unwrap_err();
            assert!(err.is_protocol(), "{line}: {err}");
        }

        let err = handler.handle_line("RDATA events 1 []").await.unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::Protocol(ProtocolError::UnknownCommand(_))
        ));
    }
}
