//! Typed bodies of outbound SEND frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence status reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl std::str::FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown presence status: {other}")),
        }
    }
}

/// User activity / presence update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub status: PresenceStatus,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Typing indicator for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    pub is_typing: bool,
}

/// Kind of call-signalling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallSignalType {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
    Ring,
    Reject,
}

impl std::str::FromStr for CallSignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice-candidate" | "ice_candidate" => Ok(Self::IceCandidate),
            "hangup" => Ok(Self::Hangup),
            "ring" => Ok(Self::Ring),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown call signal: {other}")),
        }
    }
}

/// Call-signalling message relayed to another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignalPayload {
    pub call_id: String,
    pub signal: CallSignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    /// Signal-specific data (SDP, ICE candidate, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typing_wire_shape() {
        let payload = TypingPayload {
            conversation_id: "c-42".into(),
            is_typing: true,
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"conversationId": "c-42", "isTyping": true})
        );
    }

    #[test]
    fn test_activity_omits_missing_timestamp() {
        let payload = ActivityPayload {
            status: PresenceStatus::Away,
            workspace_id: "ws-1".into(),
            last_active_at: None,
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"status": "away", "workspaceId": "ws-1"})
        );
    }

    #[test]
    fn test_call_signal_wire_shape() {
        let payload = CallSignalPayload {
            call_id: "call-1".into(),
            signal: CallSignalType::IceCandidate,
            target_user_id: Some("u-2".into()),
            data: json!({"candidate": "a=candidate:1"}),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "callId": "call-1",
                "signal": "ice-candidate",
                "targetUserId": "u-2",
                "data": {"candidate": "a=candidate:1"}
            })
        );
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("BUSY".parse::<PresenceStatus>().unwrap(), PresenceStatus::Busy);
        assert_eq!("ice_candidate".parse::<CallSignalType>().unwrap(), CallSignalType::IceCandidate);
        assert!("dancing".parse::<PresenceStatus>().is_err());
    }
}
