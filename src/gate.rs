//! Authorization of a send between two identities.

use async_trait::async_trait;

use crate::storage::SharedStorage;

#[async_trait]
pub trait ConnectionGate: Send + Sync {
    /// Whether `sender` may store and route a message to `recipient`.
    async fn is_authorized(&self, sender: &str, recipient: &str) -> bool;

    fn name(&self) -> &'static str;
}

/// Only mutual friends may exchange messages.
pub struct FriendshipGate {
    storage: SharedStorage,
}

impl FriendshipGate {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ConnectionGate for FriendshipGate {
    async fn is_authorized(&self, sender: &str, recipient: &str) -> bool {
        if sender == recipient {
            return false;
        }
        let storage = self.storage.lock().await;
        match storage.are_friends(sender, recipient) {
            Ok(friends) => friends,
            Err(e) => {
                tracing::warn!("gate: friendship lookup failed: {e}");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "friends"
    }
}

/// Any authenticated identity may message any other.
pub struct OpenGate;

#[async_trait]
impl ConnectionGate for OpenGate {
    async fn is_authorized(&self, sender: &str, recipient: &str) -> bool {
        sender != recipient
    }

    fn name(&self) -> &'static str {
        "open"
    }
}
