use serde::{Deserialize, Serialize};

use crate::generation::GenerationSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    StatusUpdate,
    Error,
}

/// Frame pushed to progress subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Option<GenerationSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerMessage {
    pub fn status_update(session: GenerationSession) -> Self {
        Self { kind: MessageType::StatusUpdate, payload: Some(session), message: None }
    }

    pub fn failure(session: GenerationSession) -> Self {
        let message = session.error.clone();
        Self { kind: MessageType::Error, payload: Some(session), message }
    }

    pub fn not_found() -> Self {
        Self {
            kind: MessageType::Error,
            payload: None,
            message: Some("Session not found.".into()),
        }
    }

    /// True once no further frames will follow for this session.
    pub fn is_final(&self) -> bool {
        match &self.payload {
            Some(session) => session.status.is_terminal(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_frame_shape() {
        let raw = serde_json::to_value(ServerMessage::not_found()).unwrap();
        assert_eq!(raw["type"], "error");
        assert!(raw["payload"].is_null());
        assert_eq!(raw["message"], "Session not found.");
        assert!(ServerMessage::not_found().is_final());
    }
}
