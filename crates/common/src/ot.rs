//! Operational-transform algebra over plain-text insert/delete operations.
//!
//! Positions and lengths everywhere in this module are Unicode scalar value
//! (code point) offsets, never byte offsets. `validate`, `apply`, and
//! `transform` all count code points, so multi-byte content behaves the
//! same as ASCII.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single edit against a document, conceived at `base_version`.
///
/// Wire shape (camelCase):
/// `{opId, docId, userId, baseVersion, position, type, text? | length?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique, client-chosen identifier; echoed back in acks.
    pub op_id: String,
    pub doc_id: Uuid,
    /// Originating identity. The server overwrites this with the session's
    /// authenticated user before the operation reaches the authority.
    #[serde(default)]
    pub user_id: String,
    /// The document version the client believed it was editing.
    pub base_version: u64,
    /// Code-point offset into the document content.
    pub position: u64,
    #[serde(flatten)]
    pub edit: EditKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditKind {
    Insert { text: String },
    Delete { length: u64 },
}

impl Operation {
    /// A delete whose length reached zero through transformation. No-ops
    /// are acknowledged but never applied or broadcast.
    pub fn is_noop(&self) -> bool {
        matches!(self.edit, EditKind::Delete { length: 0 })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    PositionOutOfBounds { position: u64, content_len: u64 },

    EmptyInsert,

    ZeroLengthDelete,

    RangeOutOfBounds { position: u64, length: u64, content_len: u64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionOutOfBounds { position, content_len } => {
                write!(f, "position {position} exceeds content length {content_len}")
            }
            Self::EmptyInsert => write!(f, "insert text must not be empty"),
            Self::ZeroLengthDelete => write!(f, "delete length must be positive"),
            Self::RangeOutOfBounds { position, length, content_len } => write!(
                f,
                "delete range [{position}, {}) exceeds content length {content_len}",
                position + length
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Number of code points in `content`.
pub fn char_len(content: &str) -> u64 {
    content.chars().count() as u64
}

fn byte_offset(content: &str, position: u64) -> usize {
    content
        .char_indices()
        .nth(position as usize)
        .map(|(offset, _)| offset)
        .unwrap_or(content.len())
}

/// Check the invariants of `op` against `content`: the position is within
/// bounds, insert text is non-empty, and delete ranges stay inside the
/// content.
pub fn check(content: &str, op: &Operation) -> Result<(), ValidationError> {
    let content_len = char_len(content);
    if op.position > content_len {
        return Err(ValidationError::PositionOutOfBounds { position: op.position, content_len });
    }

    match &op.edit {
        EditKind::Insert { text } if text.is_empty() => Err(ValidationError::EmptyInsert),
        EditKind::Insert { .. } => Ok(()),
        EditKind::Delete { length: 0 } => Err(ValidationError::ZeroLengthDelete),
        EditKind::Delete { length } if op.position + length > content_len => {
            Err(ValidationError::RangeOutOfBounds {
                position: op.position,
                length: *length,
                content_len,
            })
        }
        EditKind::Delete { .. } => Ok(()),
    }
}

/// True iff `op` satisfies [`check`] against `content`.
pub fn validate(content: &str, op: &Operation) -> bool {
    check(content, op).is_ok()
}

/// Apply a validated operation to `content`. Callers must run [`check`]
/// first; out-of-bounds offsets are clamped rather than panicking.
pub fn apply(content: &str, op: &Operation) -> String {
    match &op.edit {
        EditKind::Insert { text } => {
            let at = byte_offset(content, op.position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            out
        }
        EditKind::Delete { length } => {
            let start = byte_offset(content, op.position);
            let end = byte_offset(content, op.position + length);
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
    }
}

/// Rebase `op` so that its intent survives after `other` has been applied
/// before it on the same baseline.
///
/// Tie-break: an insert by `other` at exactly `op.position` counts as having
/// happened first, so `op` shifts right. The server is the only transformer,
/// so the asymmetry of this rule cannot produce divergence between peers.
pub fn transform(op: &Operation, other: &Operation) -> Operation {
    let mut transformed = op.clone();

    match &other.edit {
        EditKind::Insert { text } => {
            if other.position <= op.position {
                transformed.position = op.position + char_len(text);
            }
        }
        EditKind::Delete { length } => {
            let other_end = other.position + length;
            transformed.position = if other_end <= op.position {
                op.position - length
            } else if other.position < op.position {
                // The anchor sat inside the removed region; collapse it to
                // the start of that region.
                other.position
            } else {
                op.position
            };

            if let EditKind::Delete { length: op_length } = op.edit {
                let overlap_start = op.position.max(other.position);
                let overlap_end = (op.position + op_length).min(other_end);
                if overlap_end > overlap_start {
                    transformed.edit =
                        EditKind::Delete { length: op_length - (overlap_end - overlap_start) };
                }
            }
        }
    }

    transformed
}
