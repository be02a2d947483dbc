//! Message routing and fan-out.
//!
//! The router is an actor: producers submit [`RouteRequest`]s into a
//! bounded priority queue (lower numeric priority wins, FIFO within a
//! class) and one worker task performs the fan-out. Running every
//! delivery through a single worker is also what keeps per-sender FIFO
//! ordering trivial.
//!
//! Delivery is non-blocking end to end. A recipient whose outbound queue
//! is full gets a bounded exponential-backoff retry (base 2 s, cap 30 s,
//! at most 3 attempts); exhausted retries and offline recipients convert
//! to offline storage, never to a stalled worker.

use crate::error::ServerError;
use crate::groups::GroupManager;
use crate::session::{SendFailure, SessionRegistry};
use crate::Result;
use parley_proto::WireMessage;
use parley_store::Store;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Default bound of the routing queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Retry backoff base, seconds.
const RETRY_BASE_SECS: u64 = 2;

/// Retry backoff cap, seconds.
const RETRY_CAP_SECS: u64 = 30;

/// Maximum delivery attempts after the first failure.
const MAX_RETRIES: u32 = 3;

/// Priority of system-originated traffic.
pub const PRIORITY_SYSTEM: u8 = 0;

/// Priority of interactive chat.
pub const PRIORITY_NORMAL: u8 = 5;

/// Priority of presence updates and other deferrable traffic.
pub const PRIORITY_LOW: u8 = 8;

/// Where a routed message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Fan out to the online members of a group, sender excluded.
    Group {
        /// Target group.
        group_id: i64,
    },
    /// Direct to one user, store-and-forward when offline.
    Private {
        /// Recipient.
        target_user: i64,
    },
    /// System traffic; dispatches on whichever target is populated.
    System {
        /// Group target, when group-scoped.
        target_group: Option<i64>,
        /// User target, when user-scoped.
        target_user: Option<i64>,
    },
    /// Every online user except the sender.
    Broadcast,
    /// Same delivery as `Private`, flagged for different client display.
    Notification {
        /// Recipient.
        target_user: i64,
    },
}

/// One unit of routing work.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Persisted message id, when the payload was stored first.
    pub message_id: Option<i64>,
    /// Originating user; 0 for the system.
    pub sender_id: i64,
    /// Target selection.
    pub kind: RouteKind,
    /// Lower value = higher priority.
    pub priority: u8,
    /// Transient traffic (presence, liveness) is never converted to
    /// offline storage; it is only worth delivering live.
    pub transient: bool,
    /// Frame delivered verbatim to every recipient.
    pub payload: WireMessage,
}

/// Fan-out result classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Every intended recipient received the frame.
    Success,
    /// At least one, but not all.
    PartialSuccess,
    /// The intended recipient set was empty.
    NoRecipients,
    /// Nobody received it.
    Failed,
}

struct QueueEntry {
    priority: u8,
    seq: u64,
    request: RouteRequest,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops
// first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

/// The routing actor.
pub struct MessageRouter {
    store: Store,
    sessions: Arc<SessionRegistry>,
    groups: Arc<GroupManager>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    capacity: usize,
    seq: AtomicU64,
    notify: Notify,
}

impl MessageRouter {
    /// Create a router with the given queue bound.
    pub fn new(
        store: Store,
        sessions: Arc<SessionRegistry>,
        groups: Arc<GroupManager>,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            sessions,
            groups,
            queue: Mutex::new(BinaryHeap::new()),
            capacity,
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a request for the worker.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the bounded queue is at capacity.
    pub fn submit(&self, request: RouteRequest) -> Result<()> {
        let mut queue = self.queue.lock().expect("router queue lock");
        if queue.len() >= self.capacity {
            return Err(ServerError::QueueFull);
        }
        queue.push(QueueEntry {
            priority: request.priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            request,
        });
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<RouteRequest> {
        self.queue
            .lock()
            .expect("router queue lock")
            .pop()
            .map(|e| e.request)
    }

    /// Run the worker until the shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(request) = self.try_pop() {
                    let outcome = self.route_now(request).await;
                    tracing::trace!(?outcome, "route processed");
                    continue;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => {
                        tracing::debug!("router worker stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Perform one fan-out immediately.
    ///
    /// This is the worker's body; it is also callable directly where the
    /// caller wants the outcome synchronously.
    pub async fn route_now(&self, request: RouteRequest) -> RouteOutcome {
        let transient = request.transient;
        match request.kind {
            RouteKind::Group { group_id } => {
                self.route_group(group_id, request.sender_id, &request.payload, transient)
                    .await
            }
            RouteKind::Private { target_user } | RouteKind::Notification { target_user } => {
                self.route_private(target_user, &request.payload, transient)
                    .await
            }
            RouteKind::Broadcast => {
                self.route_broadcast(request.sender_id, &request.payload, transient)
                    .await
            }
            RouteKind::System {
                target_group,
                target_user,
            } => match (target_group, target_user) {
                (_, Some(user)) => {
                    self.route_private(user, &request.payload, transient).await
                }
                (Some(group), None) => {
                    self.route_group(group, request.sender_id, &request.payload, transient)
                        .await
                }
                (None, None) => {
                    self.route_broadcast(request.sender_id, &request.payload, transient)
                        .await
                }
            },
        }
    }

    async fn route_group(
        &self,
        group_id: i64,
        sender_id: i64,
        payload: &WireMessage,
        transient: bool,
    ) -> RouteOutcome {
        let members = match self.groups.members(group_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(group_id, error = %e, "group fan-out failed to enumerate members");
                return RouteOutcome::Failed;
            }
        };

        let mut intended = 0usize;
        let mut delivered = 0usize;

        for member in members {
            if member.id == sender_id {
                continue;
            }
            if !self.sessions.is_online(member.id) {
                if !transient {
                    self.store_offline(member.id, payload).await;
                }
                continue;
            }

            intended += 1;
            match self.sessions.send_to_user(member.id, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(SendFailure::Offline) => {
                    // Raced a disconnect; store-and-forward instead.
                    if !transient {
                        self.store_offline(member.id, payload).await;
                    }
                }
                Err(SendFailure::Backpressure) => {
                    if !transient {
                        self.schedule_retry(member.id, payload.clone());
                    }
                }
            }
        }

        match (intended, delivered) {
            (0, _) => RouteOutcome::NoRecipients,
            (n, d) if d == n => RouteOutcome::Success,
            (_, 0) => RouteOutcome::Failed,
            _ => RouteOutcome::PartialSuccess,
        }
    }

    async fn route_private(
        &self,
        target_user: i64,
        payload: &WireMessage,
        transient: bool,
    ) -> RouteOutcome {
        match self.sessions.send_to_user(target_user, payload.clone()) {
            Ok(()) => RouteOutcome::Success,
            Err(SendFailure::Offline) => {
                // Delivery is store-and-forward; an offline recipient is
                // still a success.
                if !transient {
                    self.store_offline(target_user, payload).await;
                }
                RouteOutcome::Success
            }
            Err(SendFailure::Backpressure) => {
                if transient {
                    return RouteOutcome::Failed;
                }
                self.schedule_retry(target_user, payload.clone());
                RouteOutcome::PartialSuccess
            }
        }
    }

    async fn route_broadcast(
        &self,
        sender_id: i64,
        payload: &WireMessage,
        transient: bool,
    ) -> RouteOutcome {
        let targets: Vec<i64> = self
            .sessions
            .online_user_ids()
            .into_iter()
            .filter(|id| *id != sender_id)
            .collect();

        if targets.is_empty() {
            return RouteOutcome::NoRecipients;
        }

        let mut delivered = 0usize;
        for user_id in &targets {
            match self.sessions.send_to_user(*user_id, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(SendFailure::Offline) => {
                    if !transient {
                        self.store_offline(*user_id, payload).await;
                    }
                }
                Err(SendFailure::Backpressure) => {
                    if !transient {
                        self.schedule_retry(*user_id, payload.clone());
                    }
                }
            }
        }

        if delivered == targets.len() {
            RouteOutcome::Success
        } else if delivered > 0 {
            RouteOutcome::PartialSuccess
        } else {
            RouteOutcome::Failed
        }
    }

    async fn store_offline(&self, user_id: i64, payload: &WireMessage) {
        let json = match serde_json::to_string(payload) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(user_id, error = %e, "offline payload failed to serialize");
                return;
            }
        };
        if let Err(e) = self.store.enqueue_offline(user_id, &json).await {
            tracing::error!(user_id, error = %e, "offline enqueue failed, message dropped");
        }
    }

    /// Retry a backpressured recipient off the worker's critical path.
    fn schedule_retry(&self, user_id: i64, payload: WireMessage) {
        let sessions = Arc::clone(&self.sessions);
        let store = self.store.clone();

        tokio::spawn(async move {
            for attempt in 1..=MAX_RETRIES {
                let backoff = RETRY_BASE_SECS
                    .saturating_pow(attempt)
                    .min(RETRY_CAP_SECS);
                tokio::time::sleep(Duration::from_secs(backoff)).await;

                match sessions.send_to_user(user_id, payload.clone()) {
                    Ok(()) => {
                        tracing::debug!(user_id, attempt, "retry delivered");
                        return;
                    }
                    Err(SendFailure::Offline) => break,
                    Err(SendFailure::Backpressure) => {}
                }
            }

            // Retries exhausted or the peer went away: store-and-forward.
            tracing::debug!(user_id, "retries exhausted, converting to offline");
            if let Ok(json) = serde_json::to_string(&payload) {
                if let Err(e) = store.enqueue_offline(user_id, &json).await {
                    tracing::error!(user_id, error = %e, "offline enqueue failed after retries");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthedUser;
    use parley_proto::WireMessage;
    use tokio::sync::mpsc;

    struct Fixture {
        router: Arc<MessageRouter>,
        sessions: Arc<SessionRegistry>,
        store: Store,
    }

    async fn fixture(capacity: usize) -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        let groups = Arc::new(GroupManager::new(store.clone(), Arc::clone(&sessions)));
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            Arc::clone(&sessions),
            groups,
            capacity,
        ));
        Fixture {
            router,
            sessions,
            store,
        }
    }

    fn go_online(
        sessions: &SessionRegistry,
        user_id: i64,
        name: &str,
        queue: usize,
    ) -> mpsc::Receiver<WireMessage> {
        let (tx, rx) = mpsc::channel(queue);
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        let handle = sessions.register("127.0.0.1:5000".parse().unwrap(), tx, shutdown_tx);
        sessions.bind_user(
            handle.conn_id,
            AuthedUser {
                user_id,
                username: name.to_string(),
                session_token: "tok".to_string(),
            },
        );
        rx
    }

    fn note(content: &str) -> WireMessage {
        WireMessage::System {
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn request(kind: RouteKind, sender: i64, payload: WireMessage) -> RouteRequest {
        RouteRequest {
            message_id: None,
            sender_id: sender,
            kind,
            priority: PRIORITY_NORMAL,
            transient: false,
            payload,
        }
    }

    #[tokio::test]
    async fn test_transient_traffic_is_never_stored() {
        let f = fixture(16).await;
        let bob = f.store.create_user("bobby", "secret1").await.unwrap();

        let outcome = f
            .router
            .route_now(RouteRequest {
                transient: true,
                ..request(RouteKind::Private { target_user: bob }, 0, note("presence"))
            })
            .await;

        assert_eq!(outcome, RouteOutcome::Success);
        assert!(f.store.drain_offline(bob, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let f = fixture(1).await;
        f.router
            .submit(request(RouteKind::Broadcast, 0, note("a")))
            .unwrap();
        let err = f
            .router
            .submit(request(RouteKind::Broadcast, 0, note("b")))
            .unwrap_err();
        assert!(matches!(err, ServerError::QueueFull));
    }

    #[tokio::test]
    async fn test_priority_pops_first() {
        let f = fixture(16).await;
        f.router
            .submit(RouteRequest {
                priority: PRIORITY_LOW,
                ..request(RouteKind::Broadcast, 0, note("low"))
            })
            .unwrap();
        f.router
            .submit(RouteRequest {
                priority: PRIORITY_SYSTEM,
                ..request(RouteKind::Broadcast, 0, note("urgent"))
            })
            .unwrap();

        let first = f.router.try_pop().unwrap();
        assert!(matches!(
            first.payload,
            WireMessage::System { ref content, .. } if content == "urgent"
        ));
    }

    #[tokio::test]
    async fn test_fifo_within_priority_class() {
        let f = fixture(16).await;
        for name in ["one", "two", "three"] {
            f.router
                .submit(request(RouteKind::Broadcast, 0, note(name)))
                .unwrap();
        }
        for expected in ["one", "two", "three"] {
            let popped = f.router.try_pop().unwrap();
            assert!(matches!(
                popped.payload,
                WireMessage::System { ref content, .. } if content == expected
            ));
        }
    }

    #[tokio::test]
    async fn test_private_delivers_when_online() {
        let f = fixture(16).await;
        f.store.create_user("bobby", "secret1").await.unwrap();
        let mut rx = go_online(&f.sessions, 1, "bobby", 8);

        let outcome = f
            .router
            .route_now(request(RouteKind::Private { target_user: 1 }, 2, note("hi")))
            .await;

        assert_eq!(outcome, RouteOutcome::Success);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_private_offline_is_stored_and_still_success() {
        let f = fixture(16).await;
        let bob = f.store.create_user("bobby", "secret1").await.unwrap();

        let outcome = f
            .router
            .route_now(request(
                RouteKind::Private { target_user: bob },
                2,
                note("hi"),
            ))
            .await;

        assert_eq!(outcome, RouteOutcome::Success);
        let queued = f.store.drain_offline(bob, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].payload.contains("hi"));
    }

    #[tokio::test]
    async fn test_group_fanout_skips_sender_and_stores_offline() {
        let f = fixture(16).await;
        let alice = f.store.create_user("alice", "secret1").await.unwrap();
        let bob = f.store.create_user("bobby", "secret1").await.unwrap();
        let carol = f.store.create_user("carol", "secret1").await.unwrap();
        let public = f.store.public_group().await.unwrap();

        let mut alice_rx = go_online(&f.sessions, alice, "alice", 8);
        let mut bob_rx = go_online(&f.sessions, bob, "bobby", 8);
        // carol stays offline

        let outcome = f
            .router
            .route_now(request(
                RouteKind::Group {
                    group_id: public.id,
                },
                alice,
                note("hello group"),
            ))
            .await;

        assert_eq!(outcome, RouteOutcome::Success);
        assert!(alice_rx.try_recv().is_err(), "sender must not self-receive");
        assert!(bob_rx.try_recv().is_ok());
        assert_eq!(f.store.drain_offline(carol, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_with_no_other_members() {
        let f = fixture(16).await;
        let alice = f.store.create_user("alice", "secret1").await.unwrap();
        let public = f.store.public_group().await.unwrap();
        let _rx = go_online(&f.sessions, alice, "alice", 8);

        let outcome = f
            .router
            .route_now(request(
                RouteKind::Group {
                    group_id: public.id,
                },
                alice,
                note("echo"),
            ))
            .await;

        assert_eq!(outcome, RouteOutcome::NoRecipients);
    }

    #[tokio::test]
    async fn test_system_dispatch_prefers_user_target() {
        let f = fixture(16).await;
        f.store.create_user("bobby", "secret1").await.unwrap();
        let mut rx = go_online(&f.sessions, 1, "bobby", 8);

        let outcome = f
            .router
            .route_now(request(
                RouteKind::System {
                    target_group: Some(999),
                    target_user: Some(1),
                },
                0,
                note("for you"),
            ))
            .await;

        assert_eq!(outcome, RouteOutcome::Success);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_worker_drains_submissions() {
        let f = fixture(16).await;
        f.store.create_user("bobby", "secret1").await.unwrap();
        let mut rx = go_online(&f.sessions, 1, "bobby", 8);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Arc::clone(&f.router).spawn(shutdown_rx);

        f.router
            .submit(request(RouteKind::Private { target_user: 1 }, 2, note("a")))
            .unwrap();
        f.router
            .submit(request(RouteKind::Private { target_user: 1 }, 2, note("b")))
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, WireMessage::System { ref content, .. } if content == "a"));
        assert!(matches!(second, WireMessage::System { ref content, .. } if content == "b"));

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
