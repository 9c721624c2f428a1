use coedit_common::ot::{EditKind, Operation};
use coedit_common::protocol::ws::WsMessage;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

fn sample_op(doc_id: Uuid) -> Operation {
    Operation {
        op_id: "op-1".to_string(),
        doc_id,
        user_id: "alice".to_string(),
        base_version: 4,
        position: 2,
        edit: EditKind::Insert { text: "hi".to_string() },
    }
}

#[test]
fn message_shapes_match_wire_contract() {
    let doc_id = Uuid::new_v4();

    let samples = [
        (
            WsMessage::JoinDocument { doc_id },
            "JOIN_DOCUMENT",
            &["type", "docId"][..],
        ),
        (
            WsMessage::ApplyOp { op: sample_op(doc_id) },
            "APPLY_OP",
            &["type", "op"][..],
        ),
        (
            WsMessage::CursorUpdate { user_id: Some("alice".to_string()), position: 7 },
            "CURSOR_UPDATE",
            &["type", "userId", "position"][..],
        ),
        (
            WsMessage::SyncState {
                content: "hello".to_string(),
                version: 9,
                cursors: HashMap::from([("alice".to_string(), 3)]),
            },
            "SYNC_STATE",
            &["type", "content", "version", "cursors"][..],
        ),
        (
            WsMessage::AckOp { op_id: "op-1".to_string(), new_version: 10 },
            "ACK_OP",
            &["type", "opId", "newVersion"][..],
        ),
        (
            WsMessage::BroadcastOp { op: sample_op(doc_id) },
            "BROADCAST_OP",
            &["type", "op"][..],
        ),
        (
            WsMessage::UserJoined { user_id: "bob".to_string() },
            "USER_JOINED",
            &["type", "userId"][..],
        ),
        (
            WsMessage::UserLeft { user_id: "bob".to_string() },
            "USER_LEFT",
            &["type", "userId"][..],
        ),
        (
            WsMessage::Error {
                kind: "TOO_STALE".to_string(),
                message: "rejoin to resync".to_string(),
            },
            "ERROR",
            &["type", "kind", "message"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(message).expect("ws message should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn operation_payload_matches_wire_contract() {
    let doc_id = Uuid::new_v4();
    let value = serde_json::to_value(WsMessage::ApplyOp { op: sample_op(doc_id) })
        .expect("apply_op should serialize");

    let op = &value["op"];
    for key in ["opId", "docId", "userId", "baseVersion", "position", "type", "text"] {
        assert!(op.get(key).is_some(), "operation payload must include `{key}`");
    }
    assert_eq!(op["type"], "insert");
    assert!(op.get("length").is_none(), "insert payload must not carry `length`");
}

#[test]
fn inbound_cursor_update_needs_no_user_id() {
    let decoded: WsMessage = serde_json::from_str(r#"{"type":"CURSOR_UPDATE","position":12}"#)
        .expect("inbound cursor frame should decode");
    assert_eq!(decoded, WsMessage::CursorUpdate { user_id: None, position: 12 });

    let encoded = serde_json::to_value(decoded).expect("cursor frame should serialize");
    assert!(
        !object_keys(&encoded).contains(&"userId".to_string()),
        "absent userId must be omitted on the wire",
    );
}

#[test]
fn delete_operation_round_trips() {
    let raw = r#"{
        "type": "APPLY_OP",
        "op": {
            "opId": "op-9",
            "docId": "00000000-0000-0000-0000-000000000001",
            "userId": "ignored",
            "baseVersion": 3,
            "type": "delete",
            "position": 4,
            "length": 2
        }
    }"#;

    let decoded: WsMessage = serde_json::from_str(raw).expect("apply_op frame should decode");
    let WsMessage::ApplyOp { op } = &decoded else {
        panic!("expected APPLY_OP, got {decoded:?}");
    };
    assert_eq!(op.edit, EditKind::Delete { length: 2 });
    assert_eq!(op.base_version, 3);

    let encoded = serde_json::to_string(&decoded).expect("frame should re-encode");
    let reparsed: WsMessage = serde_json::from_str(&encoded).expect("frame should re-decode");
    assert_eq!(reparsed, decoded);
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys =
        value.as_object().expect("value should be an object").keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}
