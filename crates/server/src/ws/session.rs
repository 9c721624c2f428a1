use std::collections::HashMap;
use std::sync::Arc;

use coedit_common::protocol::ws::WsMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Outbound frames queued per session before back-pressure trips. A session
/// that falls this far behind is dropped; the client resyncs on reconnect.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
struct SessionRecord {
    user_id: String,
    doc_id: Option<Uuid>,
    outbound: mpsc::Sender<WsMessage>,
}

/// Live client sessions. Each session's transport has a single writer (its
/// socket task); everything else reaches it through the bounded outbound
/// channel registered here.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, SessionRecord>>>,
}

impl SessionStore {
    pub async fn insert(
        &self,
        session_id: Uuid,
        user_id: String,
        outbound: mpsc::Sender<WsMessage>,
    ) {
        self.sessions
            .write()
            .await
            .insert(session_id, SessionRecord { user_id, doc_id: None, outbound });
    }

    /// Remove the session, returning its identity and joined document.
    /// Safe to call twice; the second call is a no-op.
    pub async fn remove(&self, session_id: Uuid) -> Option<(String, Option<Uuid>)> {
        self.sessions
            .write()
            .await
            .remove(&session_id)
            .map(|record| (record.user_id, record.doc_id))
    }

    pub async fn user_for_session(&self, session_id: Uuid) -> Option<String> {
        self.sessions.read().await.get(&session_id).map(|record| record.user_id.clone())
    }

    pub async fn doc_for_session(&self, session_id: Uuid) -> Option<Uuid> {
        self.sessions.read().await.get(&session_id).and_then(|record| record.doc_id)
    }

    /// Point the session at a new document; returns false when the session
    /// is gone.
    pub async fn set_doc(&self, session_id: Uuid, doc_id: Uuid) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&session_id) {
            Some(record) => {
                record.doc_id = Some(doc_id);
                true
            }
            None => false,
        }
    }

    /// Fan a message out to every session joined to `doc_id`, optionally
    /// excluding the origin. The recipient set is snapshotted under the
    /// read lock and dispatch happens outside it, so a slow transport never
    /// stalls other recipients or the document authority.
    pub async fn broadcast_to_doc(
        &self,
        doc_id: Uuid,
        message: WsMessage,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let mut recipients = Vec::new();
        {
            let guard = self.sessions.read().await;
            for (session_id, record) in guard.iter() {
                if Some(*session_id) == exclude_session {
                    continue;
                }
                if record.doc_id == Some(doc_id) {
                    recipients.push((*session_id, record.outbound.clone()));
                }
            }
        }

        let mut sent = 0;
        let mut overflowed = Vec::new();
        for (session_id, recipient) in recipients {
            match recipient.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(session_id),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for session_id in overflowed {
            warn!(session_id = %session_id, "outbound queue overflow, dropping session");
            self.sessions.write().await.remove(&session_id);
        }

        sent
    }
}
