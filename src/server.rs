//! The connection server.
//!
//! [`Server`] runs an accept loop on a listener and serves every incoming
//! connection with its handler on a dedicated task. Temporary accept errors
//! are retried with a growing backoff; anything else ends the loop. On
//! shutdown the listener is closed first so no new connection is admitted,
//! then the server waits for every in-flight handler to return.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::conn::Stream;
use crate::error::is_temporary;
use crate::handler::{Handler, PacketHandler};
use crate::listen::{listen, Accept, PacketConn};

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Listens on `addr` and serves connections with `handler` until `shutdown`
/// is cancelled.
pub async fn listen_and_serve(
    addr: &str,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    Server::new(addr, handler)
        .with_shutdown(shutdown)
        .listen_and_serve()
        .await
}

/// A server that accepts connections over TCP or unix domains.
pub struct Server {
    /// Address to listen on, in the grammar understood by
    /// [`listen`](crate::listen::listen).
    pub addr: String,

    /// Handler invoked for each accepted connection.
    pub handler: Arc<dyn Handler>,

    /// Cancelling this token initiates a graceful shutdown.
    pub shutdown: CancellationToken,
}

impl Server {
    pub fn new(addr: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Resolves the configured address and serves it.
    pub async fn listen_and_serve(&self) -> anyhow::Result<()> {
        let lstn = listen(&self.addr).await?;
        self.serve(lstn).await
    }

    /// Accepts connections from `lstn` until shutdown or a fatal accept
    /// error. The listener is owned by the server and closed by the time
    /// this returns; so is every connection that was dispatched.
    pub async fn serve<A: Accept>(&self, mut lstn: A) -> anyhow::Result<()> {
        if let Ok(addr) = lstn.local_addr() {
            info!(net = %addr.net, addr = %addr, "listening");
        }

        // Handlers run under a scope derived from the shutdown token, so a
        // server that stops for any reason takes its connections with it.
        let scope = self.shutdown.child_token();
        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut peers: HashMap<Id, (String, String)> = HashMap::new();
        let mut attempt: u32 = 0;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),

                res = lstn.accept() => match res {
                    Ok(conn) => {
                        attempt = 0;
                        self.dispatch(conn, &scope, &mut tasks, &mut peers);
                    }
                    Err(e) if is_temporary(&e) => {
                        let millis = 10u64.saturating_mul(u64::from(attempt) * u64::from(attempt));
                        let backoff = MAX_ACCEPT_BACKOFF.min(Duration::from_millis(millis));
                        attempt += 1;
                        warn!("Accept error: {e}; retrying in {backoff:?}");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = self.shutdown.cancelled() => break Ok(()),
                        }
                    }
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            break Ok(());
                        }
                        break Err(e.into());
                    }
                },

                Some(res) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    reap(res, &mut peers);
                }
            }
        };

        // Close the listener before draining so nothing new is admitted,
        // and release the handlers still blocked on I/O.
        drop(lstn);
        scope.cancel();

        while let Some(res) = tasks.join_next_with_id().await {
            reap(res, &mut peers);
        }

        result
    }

    fn dispatch(
        &self,
        conn: Box<dyn Stream>,
        scope: &CancellationToken,
        tasks: &mut JoinSet<anyhow::Result<()>>,
        peers: &mut HashMap<Id, (String, String)>,
    ) {
        let laddr = describe(conn.local_addr());
        let raddr = describe(conn.peer_addr());
        let handler = Arc::clone(&self.handler);
        let ctx = scope.child_token();

        let handle = tasks.spawn(async move { handler.serve_conn(ctx, conn).await });
        peers.insert(handle.id(), (laddr, raddr));
    }
}

/// Serves datagrams from `conn` with `handler` until `shutdown` is
/// cancelled. Datagrams are handled one at a time, in arrival order;
/// handler failures are logged and do not stop the loop.
pub async fn serve_packets(
    conn: &PacketConn,
    handler: &dyn PacketHandler,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = conn.recv_from(&mut buf) => {
                let (n, from) = res?;
                let data = buf[..n].to_vec();
                if let Err(e) = handler
                    .serve_packet(shutdown.clone(), conn, from.clone(), data)
                    .await
                {
                    error!("error serving packet from {from}: {e:#}");
                }
            }
        }
    }
}

fn describe(addr: std::io::Result<crate::conn::NetAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string())
}

/// Logs the outcome of a finished handler task. Handler failures and panics
/// never propagate to the accept loop or to other connections.
fn reap(
    res: Result<(Id, anyhow::Result<()>), JoinError>,
    peers: &mut HashMap<Id, (String, String)>,
) {
    match res {
        Ok((id, Ok(()))) => {
            peers.remove(&id);
        }
        Ok((id, Err(e))) => {
            let (laddr, raddr) = peers
                .remove(&id)
                .unwrap_or_else(|| ("?".to_string(), "?".to_string()));
            error!("error serving {laddr}->{raddr}: {e:#}");
        }
        Err(join) if join.is_panic() => {
            let id = join.id();
            let (laddr, raddr) = peers
                .remove(&id)
                .unwrap_or_else(|| ("?".to_string(), "?".to_string()));
            let payload = join.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("panic serving {laddr}->{raddr}: {msg}");
        }
        Err(join) => {
            peers.remove(&join.id());
        }
    }
}
