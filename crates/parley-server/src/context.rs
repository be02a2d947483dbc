//! Shared server context.
//!
//! No module-level singletons: everything a connection task needs hangs
//! off one explicitly constructed [`ServerContext`], so tests can wire an
//! in-memory store or a scripted assistant provider without touching
//! global state.

use crate::ai::{AiRelay, ChatCompletion, OpenAiChatClient};
use crate::auth::AuthService;
use crate::config::ServerConfig;
use crate::groups::GroupManager;
use crate::router::{MessageRouter, DEFAULT_QUEUE_CAPACITY};
use crate::session::SessionRegistry;
use crate::transfer::FileTransferCoordinator;
use parley_store::Store;
use std::sync::Arc;

/// Everything reachable from a connection handler.
pub struct ServerContext {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Persistent store handle.
    pub store: Store,
    /// Live connections and user bindings.
    pub sessions: Arc<SessionRegistry>,
    /// Registration, login and logout.
    pub auth: AuthService,
    /// Group membership operations.
    pub groups: Arc<GroupManager>,
    /// Fan-out actor.
    pub router: Arc<MessageRouter>,
    /// In-flight file transfers.
    pub transfers: Arc<FileTransferCoordinator>,
    /// Assistant relay; `None` when disabled.
    pub ai: Option<Arc<AiRelay>>,
}

impl ServerContext {
    /// Wire the full component graph over a store.
    #[must_use]
    pub fn new(config: ServerConfig, store: Store) -> Arc<Self> {
        let provider: Option<Box<dyn ChatCompletion>> = if config.ai_enabled {
            Some(Box::new(OpenAiChatClient::new(
                config.ai_endpoint.clone(),
                config.ai_api_key.clone(),
                config.ai_model.clone(),
            )))
        } else {
            None
        };
        Self::with_provider(config, store, provider)
    }

    /// Wire the component graph with an explicit assistant provider.
    ///
    /// Tests inject scripted providers here; `provider = None` disables
    /// the relay regardless of configuration.
    #[must_use]
    pub fn with_provider(
        config: ServerConfig,
        store: Store,
        provider: Option<Box<dyn ChatCompletion>>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new());
        let auth = AuthService::new(store.clone(), Arc::clone(&sessions));
        let groups = Arc::new(GroupManager::new(store.clone(), Arc::clone(&sessions)));
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            Arc::clone(&sessions),
            Arc::clone(&groups),
            DEFAULT_QUEUE_CAPACITY,
        ));
        let transfers = Arc::new(FileTransferCoordinator::new(
            store.clone(),
            config.storage_root.clone(),
            config.max_file_size,
            config.chunk_size_default,
        ));
        let ai = provider.map(|p| {
            Arc::new(AiRelay::new(
                p,
                config.ai_context_window,
                config.ai_deadline(),
                config.ai_max_retries,
            ))
        });

        Arc::new(Self {
            config,
            store,
            sessions,
            auth,
            groups,
            router,
            transfers,
            ai,
        })
    }
}
