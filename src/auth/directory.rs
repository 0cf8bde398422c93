use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::info;

use crate::{
    errors::{AppError, Result},
    models::{UserAccount, UserId},
};

/// Registered accounts, keyed by username.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<String, UserAccount>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(&self, username: &str, password_hash: String) -> Result<UserAccount> {
        match self.users.entry(username.to_string()) {
            Entry::Occupied(_) => Err(AppError::Conflict("Username already exists".to_string())),
            Entry::Vacant(slot) => {
                let account = UserAccount {
                    id: UserId::new(),
                    username: username.to_string(),
                    password_hash,
                    created_at: Utc::now(),
                };
                slot.insert(account.clone());
                info!(user_id = %account.id, username, "User registered");
                Ok(account)
            }
        }
    }

    pub fn find_by_username(&self, username: &str) -> Option<UserAccount> {
        self.users.get(username).map(|entry| entry.value().clone())
    }

    /// Drops an account whose storage could not be provisioned.
    pub fn remove(&self, username: &str) -> Option<UserAccount> {
        self.users.remove(username).map(|(_, account)| account)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find_user() {
        let directory = UserDirectory::new();
        let created = directory.create_user("alice", "hash".to_string()).unwrap();

        let found = directory.find_by_username("alice").unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.password_hash, "hash");
        assert!(directory.find_by_username("bob").is_none());
    }

    #[test]
    fn test_duplicate_username_conflicts() {
        let directory = UserDirectory::new();
        directory.create_user("alice", "hash".to_string()).unwrap();

        assert!(matches!(
            directory.create_user("alice", "other".to_string()),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(directory.len(), 1);
    }
}
