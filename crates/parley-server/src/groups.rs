//! Group membership over the store and the live session registry.
//!
//! A private chat between two users is not a special code path: it is a
//! regular group with `is_private_chat` set and exactly two members, and
//! message fan-out treats it like any other group.

use crate::error::ServerError;
use crate::session::SessionRegistry;
use crate::Result;
use parley_proto::UserEntry;
use parley_store::{ChatGroup, Store, User};
use std::sync::Arc;

/// Group operations.
pub struct GroupManager {
    store: Store,
    sessions: Arc<SessionRegistry>,
}

impl GroupManager {
    /// Create the manager.
    pub fn new(store: Store, sessions: Arc<SessionRegistry>) -> Self {
        Self { store, sessions }
    }

    /// Create a group with the creator as first member.
    ///
    /// A private chat requires exactly one peer name; the resulting
    /// membership is exactly `{creator, peer}`.
    ///
    /// # Errors
    ///
    /// `GroupExists`, `UserNotFound` for an unknown peer, `InvalidInput`
    /// for a malformed name or wrong private-chat member count.
    pub async fn create_group(
        &self,
        creator_id: i64,
        name: &str,
        is_private: bool,
        member_names: &[String],
    ) -> Result<ChatGroup> {
        if is_private && member_names.len() != 1 {
            return Err(ServerError::invalid_input(
                "a private chat needs exactly one peer",
            ));
        }

        // Resolve peers before creating anything; an unknown name must
        // not leave an empty group behind.
        let mut member_ids = Vec::with_capacity(member_names.len());
        for peer in member_names {
            let user = self
                .store
                .get_user_by_name(peer)
                .await?
                .ok_or(ServerError::UserNotFound)?;
            if user.id != creator_id {
                member_ids.push(user.id);
            }
        }

        let group = self.store.create_group(name, is_private).await?;
        self.store.add_member(group.id, creator_id).await?;
        for id in member_ids {
            self.store.add_member(group.id, id).await?;
        }

        Ok(group)
    }

    /// Resolve a group by id.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn get(&self, group_id: i64) -> Result<ChatGroup> {
        Ok(self.store.get_group(group_id).await?)
    }

    /// Resolve a group by name.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn get_by_name(&self, name: &str) -> Result<ChatGroup> {
        self.store
            .get_group_by_name(name)
            .await?
            .ok_or(ServerError::GroupNotFound)
    }

    /// Join a group. Idempotent.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` / `UserNotFound`.
    pub async fn join(&self, user_id: i64, group_id: i64) -> Result<ChatGroup> {
        let group = self.store.get_group(group_id).await?;
        self.store.add_member(group_id, user_id).await?;
        tracing::info!(user_id, group_id, group = %group.name, "joined group");
        Ok(group)
    }

    /// Leave a group. Banned groups can still be left.
    ///
    /// # Errors
    ///
    /// `NotAMember` if the user was not in the group.
    pub async fn leave(&self, user_id: i64, group_id: i64) -> Result<ChatGroup> {
        let group = self.store.get_group(group_id).await?;
        self.store.remove_member(group_id, user_id).await?;
        tracing::info!(user_id, group_id, group = %group.name, "left group");
        Ok(group)
    }

    /// Whether a user belongs to a group.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn is_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        Ok(self.store.is_member(group_id, user_id).await?)
    }

    /// All members of a group.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn members(&self, group_id: i64) -> Result<Vec<User>> {
        Ok(self.store.list_members(group_id).await?)
    }

    /// Member ids currently holding a live session.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn online_members(&self, group_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .store
            .list_members(group_id)
            .await?
            .into_iter()
            .map(|u| u.id)
            .filter(|id| self.sessions.is_online(*id))
            .collect())
    }

    /// Members with presence flags, for `user_list` frames.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn user_entries(&self, group_id: i64) -> Result<Vec<UserEntry>> {
        Ok(self
            .store
            .list_members(group_id)
            .await?
            .into_iter()
            .map(|u| {
                let session = self.sessions.for_user(u.id);
                UserEntry {
                    user_id: u.id,
                    username: u.username,
                    online: session.is_some(),
                    away: session.is_some_and(|s| s.is_away()),
                }
            })
            .collect())
    }
}
