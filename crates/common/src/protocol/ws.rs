// WebSocket message types for the coedit collaboration protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::Operation;

/// All message types exchanged over a coedit WebSocket connection.
///
/// Each text frame carries exactly one of these, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WsMessage {
    /// Client -> Server: join or switch the active document.
    JoinDocument { doc_id: Uuid },

    /// Client -> Server: submit an edit. The server overwrites `op.userId`
    /// with the session's authenticated identity.
    ApplyOp { op: Operation },

    /// Bidirectional: advisory cursor position. Inbound frames carry only
    /// `position`; outbound peer frames name the owning user.
    CursorUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        position: u64,
    },

    /// Server -> Client: full document state on join or resync.
    SyncState {
        content: String,
        version: u64,
        cursors: HashMap<String, u64>,
    },

    /// Server -> Client: originator-only acknowledgement. `newVersion` is
    /// unchanged when the operation transformed to a no-op.
    AckOp { op_id: String, new_version: u64 },

    /// Server -> Client: the post-transform operation for peers to apply.
    BroadcastOp { op: Operation },

    /// Server -> Client: a user joined the document.
    UserJoined { user_id: String },

    /// Server -> Client: a user left the document.
    UserLeft { user_id: String },

    /// Server -> Client: operation-scoped failure, sent to the origin only.
    Error { kind: String, message: String },
}
