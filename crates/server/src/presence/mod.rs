//! Ephemeral presence: which users sit on a document and where their
//! cursors are.
//!
//! Each document's presence hash carries one TTL that any write refreshes.
//! Crashed clients need no explicit cleanup; their entries disappear when
//! the TTL lapses. Cursor positions are advisory metadata and are never
//! validated against document content.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct DocPresence {
    cursors: HashMap<String, u64>,
    expires_at: Instant,
}

impl DocPresence {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
pub struct PresenceRegistry {
    docs: RwLock<HashMap<Uuid, DocPresence>>,
    ttl: Duration,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

impl PresenceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { docs: RwLock::new(HashMap::new()), ttl }
    }

    /// Record `user_id` on the document with an initial cursor at 0 and
    /// refresh the document's TTL.
    pub async fn join(&self, doc_id: Uuid, user_id: &str) {
        self.write(doc_id, user_id, 0).await;
    }

    /// Upsert the user's cursor and refresh the document's TTL.
    pub async fn update_cursor(&self, doc_id: Uuid, user_id: &str, position: u64) {
        self.write(doc_id, user_id, position).await;
    }

    async fn write(&self, doc_id: Uuid, user_id: &str, position: u64) {
        let mut docs = self.docs.write().await;
        let doc = docs.entry(doc_id).or_insert_with(|| DocPresence {
            cursors: HashMap::new(),
            expires_at: Instant::now() + self.ttl,
        });
        if doc.expired() {
            doc.cursors.clear();
        }
        doc.cursors.insert(user_id.to_string(), position);
        doc.expires_at = Instant::now() + self.ttl;
    }

    /// Remove the user's entry. Does not refresh the TTL for the others.
    pub async fn leave(&self, doc_id: Uuid, user_id: &str) {
        let mut docs = self.docs.write().await;
        if let Some(doc) = docs.get_mut(&doc_id) {
            doc.cursors.remove(user_id);
            if doc.cursors.is_empty() {
                docs.remove(&doc_id);
            }
        }
    }

    pub async fn list_users(&self, doc_id: Uuid) -> Vec<String> {
        let docs = self.docs.read().await;
        let mut users = docs
            .get(&doc_id)
            .filter(|doc| !doc.expired())
            .map(|doc| doc.cursors.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub async fn cursors(&self, doc_id: Uuid) -> HashMap<String, u64> {
        let docs = self.docs.read().await;
        docs.get(&doc_id)
            .filter(|doc| !doc.expired())
            .map(|doc| doc.cursors.clone())
            .unwrap_or_default()
    }

    /// Drop expired documents; returns how many were reaped.
    pub async fn purge_expired(&self) -> usize {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, doc| !doc.expired());
        before - docs.len()
    }
}
