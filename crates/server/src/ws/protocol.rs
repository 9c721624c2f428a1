use axum::extract::ws::{Message, WebSocket};
use coedit_common::protocol::ws::WsMessage;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// The single reply a session gets for an undecodable frame; the session
/// itself continues.
pub fn malformed_message_error() -> WsMessage {
    WsMessage::Error {
        kind: "MALFORMED_MESSAGE".to_string(),
        message: "Invalid message format".to_string(),
    }
}
