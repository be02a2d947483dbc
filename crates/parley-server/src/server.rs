//! TCP accept loop and server lifecycle.
//!
//! Binds with address reuse so a restart never trips over a lingering
//! TIME_WAIT socket, accepts until told to stop, and spawns one handler
//! task per connection. Shutdown is graceful: stop accepting, tell every
//! registered session `server_shutdown`, give handlers a bounded drain
//! window, then force-close whatever remains.

use crate::ai::CONTEXT_IDLE_EVICTION;
use crate::context::ServerContext;
use crate::handler::run_connection;
use crate::Result;
use parley_proto::WireMessage;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Listen backlog.
const BACKLOG: i32 = 128;

/// How long handlers get to drain at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The chat server: listener plus background maintenance tasks.
pub struct ChatServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    internal_shutdown: watch::Sender<bool>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl ChatServer {
    /// Bind the configured address and start the router worker and the
    /// periodic sweeps.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(ctx: Arc<ServerContext>) -> Result<Self> {
        let addr = ctx.config.listen_addr()?;
        let listener = Self::listener_with_reuse(addr)?;

        let (internal_shutdown, _) = watch::channel(false);
        let mut background = Vec::new();

        background.push(
            Arc::clone(&ctx.router).spawn(internal_shutdown.subscribe()),
        );
        background.push(Self::spawn_session_sweep(
            Arc::clone(&ctx),
            internal_shutdown.subscribe(),
        ));
        background.push(Self::spawn_offline_reaper(
            Arc::clone(&ctx),
            internal_shutdown.subscribe(),
        ));
        if ctx.ai.is_some() {
            background.push(Self::spawn_ai_eviction(
                Arc::clone(&ctx),
                internal_shutdown.subscribe(),
            ));
        }

        match ctx.store.stats().await {
            Ok(stats) => tracing::info!(
                users = stats.users,
                groups = stats.groups,
                messages = stats.messages,
                files = stats.files,
                offline_pending = stats.offline_pending,
                "store opened"
            ),
            Err(e) => tracing::warn!(error = %e, "store stats unavailable"),
        }

        let bound = listener.local_addr()?;
        tracing::info!(addr = %bound, "listening");
        Ok(Self {
            ctx,
            listener,
            internal_shutdown,
            background,
        })
    }

    fn listener_with_reuse(addr: SocketAddr) -> Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    /// The bound address; useful when the config asked for port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared context, for tests and embedding.
    #[must_use]
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections until `shutdown` flips, then drain gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable listener failure.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if self.ctx.sessions.connection_count()
                                >= self.ctx.config.max_connections
                            {
                                tracing::warn!(%addr, "connection limit reached, refusing");
                                drop(stream);
                                continue;
                            }
                            tokio::spawn(run_connection(
                                Arc::clone(&self.ctx),
                                stream,
                                addr,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        self.shutdown_gracefully().await;
        Ok(())
    }

    async fn shutdown_gracefully(self) {
        tracing::info!("shutting down");

        let frame = WireMessage::ServerShutdown {
            reason: "server is shutting down".to_string(),
        };
        for session in self.ctx.sessions.sessions() {
            let _ = session.try_send(frame.clone());
            session.close();
        }

        // Bounded drain: wait for handlers to unwind on their own.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.ctx.sessions.connection_count() > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.ctx.sessions.connection_count();
        if remaining > 0 {
            tracing::warn!(remaining, "force-closing connections after grace period");
        }

        let _ = self.internal_shutdown.send(true);
        for task in self.background {
            task.abort();
        }
    }

    fn spawn_session_sweep(
        ctx: Arc<ServerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(ctx.config.ping_interval_seconds));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tick.tick() => {
                        let stale = ctx.sessions.sweep_stale(ctx.config.session_timeout());
                        for handle in stale {
                            if let Some(user_id) = handle.user_id() {
                                if let Err(e) = ctx.store.set_online(user_id, false).await {
                                    tracing::debug!(user_id, error = %e, "offline mirror failed");
                                }
                            }
                        }
                        let newly_away = ctx.sessions.sweep_away(ctx.config.idle_away());
                        if !newly_away.is_empty() {
                            tracing::debug!(count = newly_away.len(), "users marked away");
                        }
                    }
                }
            }
        })
    }

    fn spawn_offline_reaper(
        ctx: Arc<ServerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tick.tick() => {
                        let retention =
                            chrono::Duration::days(i64::from(ctx.config.offline_retention_days));
                        match ctx.store.reap_offline(retention).await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!(reaped = n, "offline queue reaped"),
                            Err(e) => tracing::warn!(error = %e, "offline reap failed"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_ai_eviction(
        ctx: Arc<ServerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tick.tick() => {
                        if let Some(ai) = &ctx.ai {
                            let evicted = ai.evict_idle(CONTEXT_IDLE_EVICTION);
                            if evicted > 0 {
                                tracing::debug!(evicted, "idle assistant contexts dropped");
                            }
                        }
                    }
                }
            }
        })
    }
}
