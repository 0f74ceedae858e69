//! Forward proxy server
//!
//! Every accepted connection is one session. The first request head decides
//! the session: `CONNECT` requests become opaque tunnels, plain HTTP requests
//! are rewritten to origin-form and spliced to the upstream. Blocked sessions
//! get a `403` with the decision message and are closed.

use crate::config::ProxyConfig;
use crate::error::{to_http_status, ProxyError, Result};
use crate::protocol::{
    blocked_response, error_response, upstream_head, HeadCodec, RequestTarget,
    CONNECTION_ESTABLISHED,
};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use proxycop_core::{InterceptionHook, SessionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Main proxy server implementation
pub struct ProxyServer {
    /// Server configuration
    config: ProxyConfig,

    /// Admission decisions
    hook: Arc<dyn InterceptionHook>,

    /// Next session id
    next_session: AtomicU64,

    /// One permit per live connection
    connections: Arc<Semaphore>,

    /// Total number of permits
    max_connections: u32,
}

/// Notifies the hook when a session ends, however it ends
struct SessionGuard {
    hook: Arc<dyn InterceptionHook>,
    session: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hook.connection_closed(self.session);
    }
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, hook: Arc<dyn InterceptionHook>) -> Result<Self> {
        config.validate()?;
        let max_connections = u32::try_from(config.max_connections)
            .map_err(|_| ProxyError::Config("max_connections is too large".to_string()))?;

        Ok(Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            max_connections,
            config,
            hook,
            next_session: AtomicU64::new(1),
        })
    }

    /// Get server configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the configured listening address
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr).await.map_err(|e| {
            ProxyError::Server(format!("Failed to bind to {}: {}", self.config.listen_addr, e))
        })
    }

    /// Accept connections until `shutdown` fires, then wait for live
    /// connections to wind down
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                warn!("Connection limit reached, refusing {} ({})", peer, session);
                tokio::spawn(refuse(stream));
                continue;
            };

            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    result = server.handle_connection(stream, peer, session) => {
                        if let Err(e) = result {
                            match e {
                                ProxyError::Io(_) | ProxyError::Protocol(_) => {
                                    debug!("Session {} from {} ended: {}", session, peer, e)
                                }
                                _ => warn!("Session {} from {} failed: {}", session, peer, e),
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Session {} closed by shutdown", session);
                    }
                }
            });
        }

        info!("Proxy server draining connections");
        // Every permit back means every connection task is done
        self.connections
            .acquire_many(self.max_connections)
            .await
            .map_err(|e| ProxyError::Server(e.to_string()))?;
        info!("Proxy server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        session: SessionId,
    ) -> Result<()> {
        let _guard = SessionGuard {
            hook: self.hook.clone(),
            session,
        };
        debug!("Session {} opened by {}", session, peer);

        let mut framed = Framed::new(stream, HeadCodec::new(self.config.max_head_bytes));
        let head = match timeout(self.config.head_timeout(), framed.next()).await {
            Err(_) => {
                return Err(ProxyError::Timeout(format!(
                    "No request head from {} after {:?}",
                    peer,
                    self.config.head_timeout()
                )))
            }
            Ok(None) => {
                debug!("Session {} closed before sending a request", session);
                return Ok(());
            }
            Ok(Some(Err(e))) => {
                reject(framed.get_mut(), &e).await;
                return Err(e);
            }
            Ok(Some(Ok(head))) => head,
        };

        // Bytes the client sent after the head go upstream untouched
        let parts = framed.into_parts();
        let mut client = parts.io;
        let leftover = parts.read_buf;

        let target = match head.request_target() {
            Ok(target) => target,
            Err(e) => {
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        if self.intercept(session, target.host()).await? {
            let message = self
                .hook
                .blocked_message(session)
                .unwrap_or_else(|| format!("{} is blocked", target.host()));
            info!("Blocked {} {} for {}: {}", head.method, target.authority(), peer, message);
            client.write_all(&blocked_response(&message)).await?;
            client.shutdown().await?;
            return Ok(());
        }

        let mut upstream = match self.connect(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        match &target {
            RequestTarget::Tunnel { .. } => {
                client.write_all(CONNECTION_ESTABLISHED).await?;
            }
            RequestTarget::Forward { path, .. } => {
                upstream.write_all(&upstream_head(&head, path)).await?;
            }
        }
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }

        let (sent, received) = copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(
            "Session {} to {} closed: {} bytes up, {} bytes down",
            session,
            target.authority(),
            sent,
            received
        );
        Ok(())
    }

    /// Ask the hook, off the async workers since it may hit the store
    async fn intercept(&self, session: SessionId, host: &str) -> Result<bool> {
        let hook = self.hook.clone();
        let host = host.to_string();
        Ok(tokio::task::spawn_blocking(move || hook.should_intercept(session, &host)).await?)
    }

    async fn connect(&self, target: &RequestTarget) -> Result<TcpStream> {
        let authority = target.authority();
        match timeout(
            self.config.connect_timeout(),
            TcpStream::connect((target.host(), target.port())),
        )
        .await
        {
            Err(_) => Err(ProxyError::Timeout(format!("Connecting to {}", authority))),
            Ok(Err(e)) => Err(ProxyError::Upstream(format!(
                "Failed to connect to {}: {}",
                authority, e
            ))),
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        }
    }
}

/// Answer a failed request with an error page, best effort
async fn reject(client: &mut TcpStream, err: &ProxyError) {
    let (status, reason) = to_http_status(err);
    let body = format!("{}\n", err);
    if let Err(e) = client.write_all(&error_response(status, reason, &body)).await {
        debug!("Could not send {} to client: {}", status, e);
    }
}

async fn refuse(mut stream: TcpStream) {
    let response = error_response(503, "Service Unavailable", "Too many connections\n");
    let _ = stream.write_all(&response).await;
}
