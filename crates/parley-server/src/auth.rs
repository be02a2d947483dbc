//! Registration, login and logout.
//!
//! Login never distinguishes an unknown username from a wrong password;
//! both surface as `INVALID_CREDENTIALS`. The session token is an opaque
//! random identifier bound to `(user_id, connection_id)` and stored only
//! in the session registry.

use crate::error::ServerError;
use crate::session::{AuthedUser, ConnectionId, SessionRegistry};
use crate::Result;
use parley_store::{Store, StoreError, User};
use rand::RngCore;
use std::sync::Arc;

/// Minimum password length in characters.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Outcome of a successful login.
#[derive(Debug)]
pub struct LoginOutcome {
    /// The authenticated user.
    pub user: User,
    /// Session token now bound to the connection.
    pub token: String,
    /// Whether an older session was force-logged-out.
    pub evicted_previous: bool,
}

/// Authentication service over the store and session registry.
pub struct AuthService {
    store: Store,
    sessions: Arc<SessionRegistry>,
}

fn valid_username(name: &str) -> bool {
    (3..=20).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl AuthService {
    /// Create the service.
    pub fn new(store: Store, sessions: Arc<SessionRegistry>) -> Self {
        Self { store, sessions }
    }

    /// Create an account. The new user joins the public group atomically.
    ///
    /// # Errors
    ///
    /// `InvalidInput` on malformed username or short password,
    /// `UserExists` on a taken name.
    pub async fn register(&self, username: &str, password: &str) -> Result<i64> {
        if !valid_username(username) {
            return Err(ServerError::invalid_input(
                "username must be 3-20 chars of letters, digits, underscore or dash",
            ));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ServerError::invalid_input(
                "password must be at least 6 characters",
            ));
        }

        let user_id = self.store.create_user(username, password).await?;
        Ok(user_id)
    }

    /// Authenticate and bind the user to this connection, evicting any
    /// older session for the same user.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` on unknown user or wrong password (never
    /// distinguished), `UserBanned` for banned accounts.
    pub async fn login(
        &self,
        conn_id: ConnectionId,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome> {
        if username.is_empty() || password.is_empty() {
            return Err(ServerError::InvalidCredentials);
        }

        let user = self
            .store
            .authenticate(username, password)
            .await
            .map_err(ServerError::from)?
            .ok_or(ServerError::InvalidCredentials)?;

        if user.is_banned {
            return Err(ServerError::UserBanned);
        }

        let token = new_session_token();
        let evicted = self.sessions.bind_user(
            conn_id,
            AuthedUser {
                user_id: user.id,
                username: user.username.clone(),
                session_token: token.clone(),
            },
        );
        if evicted.is_some() {
            // The evicted handler mirrors its own offline state on exit;
            // this connection owns the user from here on.
            tracing::debug!(user_id = user.id, "previous session evicted at login");
        }

        if let Err(e) = self.store.set_online(user.id, true).await {
            tracing::warn!(user_id = user.id, error = %e, "failed to mirror online state");
        }

        tracing::info!(user_id = user.id, username, conn_id, "login");
        Ok(LoginOutcome {
            user,
            token,
            evicted_previous: evicted.is_some(),
        })
    }

    /// End the session bound to a connection. Returns the user that was
    /// logged out, if any.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure while mirroring state.
    pub async fn logout(&self, conn_id: ConnectionId) -> Result<Option<i64>> {
        let Some(handle) = self.sessions.get(conn_id) else {
            return Ok(None);
        };
        let Some(user) = handle.user() else {
            return Ok(None);
        };

        match self.store.set_online(user.user_id, false).await {
            Ok(()) => {}
            Err(StoreError::UserNotFound) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user_id = user.user_id, conn_id, "logout");
        Ok(Some(user.user_id))
    }
}
