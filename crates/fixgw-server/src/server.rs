//! Netfix TCP server.
//!
//! This module provides the listener that handles:
//! - Accepting client connections
//! - One receive loop and one send loop per connection
//! - Connection teardown and subscription cleanup
//! - Cooperative shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fixgw_core::config::NetfixSettings;
use fixgw_core::ItemStore;

use crate::connection::{Connection, Outbound, ServerContext};
use crate::echo::EchoGuard;
use crate::error::ServerError;
use crate::shutdown::Shutdown;
use crate::status::{ConnectionStats, StatusCollector};

/// Configuration for the netfix server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in log messages.
    pub name: String,
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum size of one `@l` reply message, in bytes.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&NetfixSettings::default())
    }
}

impl From<&NetfixSettings> for ServerConfig {
    fn from(settings: &NetfixSettings) -> Self {
        Self {
            name: "netfix".to_string(),
            bind_addr: settings.bind_addr.clone(),
            buffer_size: settings.buffer_size,
        }
    }
}

/// The netfix server.
pub struct NetfixServer {
    config: ServerConfig,
    ctx: ServerContext,
}

impl NetfixServer {
    /// Create a server over the given store with its own echo guard, status
    /// collector and shutdown signal.
    pub fn new(config: ServerConfig, store: Arc<ItemStore>) -> Self {
        let ctx = ServerContext {
            store,
            echo: Arc::new(EchoGuard::new()),
            status: Arc::new(StatusCollector::new()),
            shutdown: Shutdown::new(),
            buffer_size: config.buffer_size,
        };
        Self { config, ctx }
    }

    /// Share an echo guard with the replication client.
    pub fn with_echo_guard(mut self, echo: Arc<EchoGuard>) -> Self {
        self.ctx.echo = echo;
        self
    }

    pub fn with_status(mut self, status: Arc<StatusCollector>) -> Self {
        self.ctx.status = status;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.ctx.shutdown = shutdown;
        self
    }

    pub fn echo_guard(&self) -> Arc<EchoGuard> {
        Arc::clone(&self.ctx.echo)
    }

    pub fn status(&self) -> Arc<StatusCollector> {
        Arc::clone(&self.ctx.status)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// Returns once the accept loop has stopped and every connection task
    /// has finished its cleanup.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        info!("{} server listening on {}", self.config.name, local);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.wait() => {
                    info!("{} server on {} shutting down", self.config.name, local);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx).await {
                                error!("Connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
) -> Result<(), ServerError> {
    info!("New connection from {}", peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let (read_half, write_half) = stream.into_split();
    run_connection(read_half, write_half, peer, ctx).await
}

/// Run the receive and send loops of one connection until either side ends.
async fn run_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    ctx: ServerContext,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stats = ctx.status.connection_opened(peer);
    let (tx, rx) = mpsc::unbounded_channel();
    // Dropped by the send loop when it stops.
    let (sender_alive, mut sender_gone) = oneshot::channel::<()>();
    let sender = tokio::spawn(send_loop(writer, rx, Arc::clone(&stats), sender_alive));

    let mut connection = Connection::new(&ctx, Arc::clone(&stats), tx);
    let mut lines = BufReader::new(reader).lines();

    let result = loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break Ok(()),
            _ = &mut sender_gone => {
                warn!("Send loop for {} stopped, closing connection", peer);
                break Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => connection.handle_line(&line),
                Ok(None) => {
                    info!("Client {} disconnected", peer);
                    break Ok(());
                }
                Err(e) => {
                    warn!("Read error from {}: {}", peer, e);
                    break Err(ServerError::Io(e));
                }
            },
        }
    };

    connection.close();
    if let Err(e) = sender.await {
        warn!("Send loop for {} ended abnormally: {}", peer, e);
    }
    ctx.status.connection_closed(stats.id);
    result
}

/// Drain the connection's queue onto the socket until `Close` or an error.
async fn send_loop<W>(
    mut writer: W,
    mut rx: UnboundedReceiver<Outbound>,
    stats: Arc<ConnectionStats>,
    _alive: oneshot::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Line(line) => {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("Failed to send to {}: {}", stats.peer, e);
                    break;
                }
                stats.record_out();
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
