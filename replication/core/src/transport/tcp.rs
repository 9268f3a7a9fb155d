//! TCP Transport
//!
//! Accepts worker connections and runs one reader and one writer task per
//! connection:
//!
//! ```text
//!   socket ──► read loop ──► LineDecoder ──► ProtocolHandler ──► Streamer
//!                                                                   │
//!   socket ◄── write loop ◄── OutboundReceiver ◄── Connection ◄─────┘
//! ```
//!
//! The reader stops on EOF, on a read error, on a bad command, or when the
//! connection is closed from the server side. The writer drains whatever is
//! still queued after close (so a final `ERROR` reaches the worker), and
//! stops early once a terminal command is written.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::Instrument;

use crate::connection::{Connection, OutboundReceiver};
use crate::error::Result;
use crate::handler::ProtocolHandler;
use crate::streamer::Streamer;

use super::codec::{encode_line, LineDecoder};

/// Read buffer size per connection
const READ_BUFFER_SIZE: usize = 8192;

/// How long the writer may keep flushing after the reader has stopped
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound TCP listener for worker connections
#[derive(Debug)]
pub struct ReplicationListener {
    listener: TcpListener,
}

impl ReplicationListener {
    /// Bind to an address
    ///
    /// # Errors
    ///
    /// Returns `Io` if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// Returns `Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection
    ///
    /// # Errors
    ///
    /// Returns `Io` on accept failure.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }

    /// Accept connections forever, serving each on its own task
    ///
    /// Returns once the streamer is shutting down. Accept errors are logged
    /// and the loop continues.
    pub async fn serve(self, streamer: Arc<Streamer>) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Replication listener started");

        while !streamer.is_shutting_down() {
            match self.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(Arc::clone(&streamer), stream, Some(peer)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serve one worker connection until it ends
///
/// Registers the connection with the streamer, runs its reader and writer,
/// and unregisters it afterwards.
pub async fn serve_connection(
    streamer: Arc<Streamer>,
    stream: TcpStream,
    peer: Option<SocketAddr>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (conn, outbound) = streamer.new_connection(peer);
    let conn_id = conn.id();

    async move {
        let (read_half, write_half) = stream.into_split();

        let writer = tokio::spawn(
            write_loop(Arc::clone(&conn), outbound, write_half).in_current_span(),
        );

        let handler = ProtocolHandler::new(Arc::clone(&streamer), Arc::clone(&conn));
        read_loop(&handler, read_half).await;

        streamer.lost_connection(&conn).await;

        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            tracing::warn!("Writer did not drain in time, aborting");
            abort.abort();
        }
    }
    .instrument(tracing::info_span!("connection", %conn_id))
    .await;
}

async fn read_loop(handler: &ProtocolHandler, mut read_half: OwnedReadHalf) {
    let conn = handler.connection();
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            () = conn.closed() => {
                tracing::debug!("Connection closed by server");
                return;
            }
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!("Worker disconnected (EOF)");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Read error");
                    return;
                }
            },
        };

        decoder.push(&buf[..n]);

        loop {
            match decoder.decode_line() {
                Ok(Some(line)) => {
                    if let Err(e) = handler.handle_line(&line).await {
                        tracing::warn!(error = %e, "Closing connection after failed command");
                        conn.send_error(e.to_string());
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to decode line");
                    conn.send_error(e.to_string());
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut outbound: OutboundReceiver,
    mut write_half: OwnedWriteHalf,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = outbound.recv() => command,
            () = conn.closed() => outbound.try_recv(),
        };
        let Some(command) = command else {
            break;
        };

        if let Err(e) = write_half.write_all(&encode_line(&command)).await {
            tracing::debug!(error = %e, "Write error");
            conn.close();
            break;
        }

        if command.is_terminal() {
            break;
        }
    }

    if let Err(e) = write_half.shutdown().await {
        tracing::trace!(error = %e, "Shutdown of write half failed");
    }
}
