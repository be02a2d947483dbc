//! Connection and session registry.
//!
//! Two concurrent maps: connection id to live session handle, and user id
//! to the connection currently bound to it. The registry owns the
//! at-most-one-session-per-user policy: binding a user who already has a
//! live connection force-logs-out the older one.
//!
//! A [`SessionHandle`] is the only way other components reach a client:
//! it wraps the connection's bounded outbound queue and its shutdown
//! signal. Sends from fan-out paths are non-blocking; a full queue is
//! reported so the router can fall back to offline storage instead of
//! stalling on a slow client.

use dashmap::DashMap;
use parley_proto::WireMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Server-local identifier of one TCP connection.
pub type ConnectionId = u64;

/// Per-connection lifecycle state.
///
/// `Connecting → Authenticating → Active → Closing → Closed`; `Closing`
/// is entered on logout, force-logout or a detected socket error, and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted, greeting not yet sent.
    Connecting,
    /// Waiting for `register`/`login`.
    Authenticating,
    /// Authenticated and serving traffic.
    Active,
    /// Tear-down in progress.
    Closing,
    /// Gone; terminal.
    Closed,
}

/// Identity bound to a connection after login.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    /// Store user id.
    pub user_id: i64,
    /// Username at login time.
    pub username: String,
    /// Opaque token handed to the client; lives only here.
    pub session_token: String,
}

/// Why a non-blocking send did not reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// No live connection for that user.
    Offline,
    /// Connection exists but its outbound queue is full.
    Backpressure,
}

#[derive(Debug)]
struct SessionMeta {
    state: ConnState,
    user: Option<AuthedUser>,
    last_ping: Instant,
    ping_latency_ms: Option<i64>,
    last_activity: Instant,
    away: bool,
}

/// Live state of one connection.
pub struct SessionHandle {
    /// Connection id.
    pub conn_id: ConnectionId,
    /// Peer address.
    pub addr: SocketAddr,
    /// Accept time.
    pub connected_at: Instant,
    outbound: mpsc::Sender<WireMessage>,
    shutdown: watch::Sender<bool>,
    meta: RwLock<SessionMeta>,
}

impl SessionHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.meta.read().expect("session meta lock").state
    }

    /// Move to a new lifecycle state. `Closed` is sticky.
    pub fn set_state(&self, state: ConnState) {
        let mut meta = self.meta.write().expect("session meta lock");
        if meta.state != ConnState::Closed {
            meta.state = state;
        }
    }

    /// Identity bound to this connection, if authenticated.
    #[must_use]
    pub fn user(&self) -> Option<AuthedUser> {
        self.meta.read().expect("session meta lock").user.clone()
    }

    /// Bound user id, if authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        self.meta
            .read()
            .expect("session meta lock")
            .user
            .as_ref()
            .map(|u| u.user_id)
    }

    fn bind(&self, user: AuthedUser) {
        let mut meta = self.meta.write().expect("session meta lock");
        meta.user = Some(user);
        meta.state = ConnState::Active;
        meta.last_activity = Instant::now();
        meta.away = false;
    }

    fn clear_user(&self) {
        self.meta.write().expect("session meta lock").user = None;
    }

    /// Record a ping and its measured round-trip latency.
    pub fn touch_ping(&self, latency_ms: Option<i64>) {
        let mut meta = self.meta.write().expect("session meta lock");
        meta.last_ping = Instant::now();
        if latency_ms.is_some() {
            meta.ping_latency_ms = latency_ms;
        }
    }

    /// Time since the last ping.
    #[must_use]
    pub fn ping_elapsed(&self) -> Duration {
        self.meta.read().expect("session meta lock").last_ping.elapsed()
    }

    /// Last measured round-trip latency in milliseconds.
    #[must_use]
    pub fn ping_latency_ms(&self) -> Option<i64> {
        self.meta.read().expect("session meta lock").ping_latency_ms
    }

    /// Record user activity, clearing any away flag.
    pub fn touch_activity(&self) {
        let mut meta = self.meta.write().expect("session meta lock");
        meta.last_activity = Instant::now();
        meta.away = false;
    }

    /// Whether the user is connected but idle.
    #[must_use]
    pub fn is_away(&self) -> bool {
        self.meta.read().expect("session meta lock").away
    }

    fn mark_away_if_idle(&self, idle: Duration) -> bool {
        let mut meta = self.meta.write().expect("session meta lock");
        if !meta.away && meta.user.is_some() && meta.last_activity.elapsed() > idle {
            meta.away = true;
            true
        } else {
            false
        }
    }

    /// Queue a frame without blocking.
    ///
    /// # Errors
    ///
    /// [`SendFailure::Backpressure`] when the outbound queue is full,
    /// [`SendFailure::Offline`] when the writer has already gone away.
    pub fn try_send(&self, msg: WireMessage) -> Result<(), SendFailure> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Offline,
        })
    }

    /// Signal the connection task to shut down.
    pub fn close(&self) {
        self.set_state(ConnState::Closing);
        let _ = self.shutdown.send(true);
    }

    /// Subscribe to the shutdown signal.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conn_id", &self.conn_id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Registry of all live connections.
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<SessionHandle>>,
    users: DashMap<i64, ConnectionId>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted connection.
    pub fn register(
        &self,
        addr: SocketAddr,
        outbound: mpsc::Sender<WireMessage>,
        shutdown: watch::Sender<bool>,
    ) -> Arc<SessionHandle> {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let handle = Arc::new(SessionHandle {
            conn_id,
            addr,
            connected_at: now,
            outbound,
            shutdown,
            meta: RwLock::new(SessionMeta {
                state: ConnState::Connecting,
                user: None,
                last_ping: now,
                ping_latency_ms: None,
                last_activity: now,
                away: false,
            }),
        });

        self.connections.insert(conn_id, Arc::clone(&handle));
        tracing::debug!(conn_id, %addr, "connection registered");
        handle
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<SessionHandle>> {
        self.connections.get(&conn_id).map(|e| Arc::clone(e.value()))
    }

    /// Live connection bound to a user, if any.
    #[must_use]
    pub fn for_user(&self, user_id: i64) -> Option<Arc<SessionHandle>> {
        let conn_id = *self.users.get(&user_id)?;
        self.get(conn_id)
    }

    /// Whether a user currently holds a live session.
    #[must_use]
    pub fn is_online(&self, user_id: i64) -> bool {
        self.users.contains_key(&user_id)
    }

    /// Bind an authenticated user to a connection, enforcing the single
    /// active session policy. Returns the evicted older session, already
    /// told to `force_logout` and close.
    pub fn bind_user(
        &self,
        conn_id: ConnectionId,
        user: AuthedUser,
    ) -> Option<Arc<SessionHandle>> {
        let handle = self.get(conn_id)?;
        let user_id = user.user_id;

        // Re-login as a different user on the same connection releases the
        // old binding.
        if let Some(prev) = handle.user_id() {
            if prev != user_id {
                self.users.remove_if(&prev, |_, bound| *bound == conn_id);
            }
        }

        let evicted = self
            .users
            .get(&user_id)
            .map(|e| *e.value())
            .filter(|old| *old != conn_id)
            .and_then(|old| self.get(old));

        if let Some(old) = &evicted {
            tracing::info!(
                user_id,
                old_conn = old.conn_id,
                new_conn = conn_id,
                "duplicate login, evicting previous session"
            );
            let _ = old.try_send(WireMessage::ForceLogout {
                reason: "logged in from another location".to_string(),
            });
            // Unbind first so the old handler's cleanup cannot race away
            // the fresh user mapping.
            old.clear_user();
            old.close();
        }

        self.users.insert(user_id, conn_id);
        handle.bind(user);
        evicted
    }

    /// Drop a connection from the registry. Removes the user binding only
    /// if it still points at this connection.
    pub fn unregister(&self, conn_id: ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(&conn_id) {
            if let Some(user_id) = handle.user_id() {
                self.users
                    .remove_if(&user_id, |_, bound| *bound == conn_id);
            }
            handle.set_state(ConnState::Closed);
            tracing::debug!(conn_id, "connection unregistered");
        }
    }

    /// Ids of all users with a live session.
    #[must_use]
    pub fn online_user_ids(&self) -> Vec<i64> {
        self.users.iter().map(|e| *e.key()).collect()
    }

    /// All registered session handles.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Non-blocking send to a user's live connection.
    ///
    /// # Errors
    ///
    /// See [`SendFailure`].
    pub fn send_to_user(&self, user_id: i64, msg: WireMessage) -> Result<(), SendFailure> {
        match self.for_user(user_id) {
            Some(handle) => handle.try_send(msg),
            None => Err(SendFailure::Offline),
        }
    }

    /// Fan a frame out to every bound user except `except`. Returns the
    /// user ids that could not be reached.
    pub fn broadcast(&self, msg: &WireMessage, except: Option<i64>) -> Vec<i64> {
        let mut missed = Vec::new();
        for entry in self.users.iter() {
            let user_id = *entry.key();
            if Some(user_id) == except {
                continue;
            }
            if self.send_to_user(user_id, msg.clone()).is_err() {
                missed.push(user_id);
            }
        }
        missed
    }

    /// Refresh a user's activity timer, clearing the away flag.
    pub fn update_activity(&self, user_id: i64) {
        if let Some(handle) = self.for_user(user_id) {
            handle.touch_activity();
        }
    }

    /// Tear down sessions whose last ping is older than `timeout`, as if
    /// their sockets errored. Returns the closed handles.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<Arc<SessionHandle>> {
        let stale: Vec<Arc<SessionHandle>> = self
            .connections
            .iter()
            .filter(|e| {
                let h = e.value();
                h.state() != ConnState::Closed && h.ping_elapsed() > timeout
            })
            .map(|e| Arc::clone(e.value()))
            .collect();

        for handle in &stale {
            tracing::info!(conn_id = handle.conn_id, "session timed out, closing");
            handle.close();
        }
        stale
    }

    /// Mark idle users away. Returns the affected user ids.
    pub fn sweep_away(&self, idle: Duration) -> Vec<i64> {
        self.connections
            .iter()
            .filter(|e| e.value().mark_away_if_idle(idle))
            .filter_map(|e| e.value().user_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn register(reg: &SessionRegistry) -> (Arc<SessionHandle>, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = watch::channel(false);
        (reg.register(addr(), tx, shutdown_tx), rx)
    }

    fn authed(user_id: i64, name: &str) -> AuthedUser {
        AuthedUser {
            user_id,
            username: name.to_string(),
            session_token: "tok".to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = SessionRegistry::new();
        let (handle, _rx) = register(&reg);

        assert_eq!(handle.state(), ConnState::Connecting);
        assert!(reg.get(handle.conn_id).is_some());
        assert_eq!(reg.connection_count(), 1);

        assert!(handle.ping_latency_ms().is_none());
        handle.touch_ping(Some(12));
        assert_eq!(handle.ping_latency_ms(), Some(12));
        assert!(handle.ping_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_bind_user_sets_active() {
        let reg = SessionRegistry::new();
        let (handle, _rx) = register(&reg);

        let evicted = reg.bind_user(handle.conn_id, authed(7, "alice"));
        assert!(evicted.is_none());
        assert_eq!(handle.state(), ConnState::Active);
        assert!(reg.is_online(7));
        assert_eq!(reg.for_user(7).unwrap().conn_id, handle.conn_id);
    }

    #[test]
    fn test_duplicate_login_evicts_older_session() {
        let reg = SessionRegistry::new();
        let (old, mut old_rx) = register(&reg);
        let (new, _new_rx) = register(&reg);

        reg.bind_user(old.conn_id, authed(7, "alice"));
        let evicted = reg.bind_user(new.conn_id, authed(7, "alice")).unwrap();

        assert_eq!(evicted.conn_id, old.conn_id);
        assert_eq!(old.state(), ConnState::Closing);
        assert!(*old.shutdown_signal().borrow());
        // Old connection got the force_logout frame.
        let frame = old_rx.try_recv().unwrap();
        assert!(matches!(frame, WireMessage::ForceLogout { .. }));
        // The user now maps to the newer connection.
        assert_eq!(reg.for_user(7).unwrap().conn_id, new.conn_id);
    }

    #[test]
    fn test_stale_unregister_keeps_new_binding() {
        let reg = SessionRegistry::new();
        let (old, _a) = register(&reg);
        let (new, _b) = register(&reg);

        reg.bind_user(old.conn_id, authed(7, "alice"));
        reg.bind_user(new.conn_id, authed(7, "alice"));

        // Old handler finally exits; the fresh binding must survive.
        reg.unregister(old.conn_id);
        assert_eq!(reg.for_user(7).unwrap().conn_id, new.conn_id);
    }

    #[test]
    fn test_send_to_user_failures() {
        let reg = SessionRegistry::new();
        assert_eq!(
            reg.send_to_user(1, WireMessage::Logout).unwrap_err(),
            SendFailure::Offline
        );

        let (handle, _rx) = register(&reg);
        reg.bind_user(handle.conn_id, authed(1, "alice"));

        // Fill the bounded queue.
        for _ in 0..8 {
            reg.send_to_user(1, WireMessage::Logout).unwrap();
        }
        assert_eq!(
            reg.send_to_user(1, WireMessage::Logout).unwrap_err(),
            SendFailure::Backpressure
        );
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let reg = SessionRegistry::new();
        let (a, mut a_rx) = register(&reg);
        let (b, mut b_rx) = register(&reg);
        reg.bind_user(a.conn_id, authed(1, "alice"));
        reg.bind_user(b.conn_id, authed(2, "bobby"));

        let missed = reg.broadcast(
            &WireMessage::System {
                content: "hi".to_string(),
                timestamp: chrono::Utc::now(),
            },
            Some(1),
        );

        assert!(missed.is_empty());
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_sweep_stale_closes_everything_at_zero_timeout() {
        let reg = SessionRegistry::new();
        let (handle, _rx) = register(&reg);
        reg.bind_user(handle.conn_id, authed(1, "alice"));

        let stale = reg.sweep_stale(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(handle.state(), ConnState::Closing);
    }

    #[test]
    fn test_sweep_away_marks_idle_users() {
        let reg = SessionRegistry::new();
        let (handle, _rx) = register(&reg);
        reg.bind_user(handle.conn_id, authed(1, "alice"));

        assert_eq!(reg.sweep_away(Duration::ZERO), vec![1]);
        assert!(handle.is_away());
        // Second sweep reports nothing new.
        assert!(reg.sweep_away(Duration::ZERO).is_empty());

        reg.update_activity(1);
        assert!(!handle.is_away());
    }
}
