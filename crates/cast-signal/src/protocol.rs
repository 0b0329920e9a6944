//! Wire contract between browser clients and the signaling core.
//!
//! Every frame is one JSON object `{"type": ..., "payload": ...}` whose
//! payload shape is fixed by the tag. Anything outside the five known
//! kinds fails to decode.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{SignalError, SignalResult};

/// Identifier the transport layer assigns to one signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(text)
    }
}

/// Same JSON shape as the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Same JSON shape as the browser's `RTCIceCandidateInit`.
///
/// An empty `candidate` string marks end-of-candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    pub fn end_of_candidates() -> Self {
        Self::default()
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAckPayload {
    pub message: String,
    pub client_id: String,
}

impl HandshakeAckPayload {
    pub fn for_client(client_id: &ClientId) -> Self {
        Self {
            message: format!("Handshake acknowledged for client {client_id}"),
            client_id: client_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    #[serde(deserialize_with = "null_as_end_of_candidates")]
    pub candidate: IceCandidate,
}

fn null_as_end_of_candidates<'de, D>(deserializer: D) -> Result<IceCandidate, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<IceCandidate>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Handshake(HandshakePayload),
    HandshakeAck(HandshakeAckPayload),
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
}

impl SignalingMessage {
    pub fn handshake(client_id: impl Into<String>) -> Self {
        SignalingMessage::Handshake(HandshakePayload {
            client_id: client_id.into(),
        })
    }

    pub fn offer(sdp: SessionDescription) -> Self {
        SignalingMessage::Offer(SdpPayload { sdp })
    }

    pub fn answer(sdp: SessionDescription) -> Self {
        SignalingMessage::Answer(SdpPayload { sdp })
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate(CandidatePayload { candidate })
    }

    /// Wire tag, also used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Handshake(_) => "handshake",
            SignalingMessage::HandshakeAck(_) => "handshake-ack",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
        }
    }

    pub fn decode(text: &str) -> SignalResult<Self> {
        let message: SignalingMessage =
            serde_json::from_str(text).map_err(|err| SignalError::Malformed(err.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> SignalResult<String> {
        serde_json::to_string(self).map_err(|err| SignalError::Malformed(err.to_string()))
    }

    fn validate(&self) -> SignalResult<()> {
        match self {
            SignalingMessage::Offer(SdpPayload { sdp }) => {
                if sdp.kind != SdpType::Offer {
                    return Err(SignalError::Malformed(format!(
                        "offer carries a description of type '{}'",
                        sdp.kind
                    )));
                }
                if sdp.sdp.trim().is_empty() {
                    return Err(SignalError::Malformed("offer carries an empty sdp".into()));
                }
                Ok(())
            }
            SignalingMessage::Answer(SdpPayload { sdp }) if sdp.kind != SdpType::Answer => {
                Err(SignalError::Malformed(format!(
                    "answer carries a description of type '{}'",
                    sdp.kind
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_browser_offer() {
        let text = json!({
            "type": "offer",
            "payload": { "sdp": { "type": "offer", "sdp": "v=0\r\n" } }
        })
        .to_string();
        let message = SignalingMessage::decode(&text).expect("offer decodes");
        assert_eq!(
            message,
            SignalingMessage::offer(SessionDescription::offer("v=0\r\n"))
        );
    }

    #[test]
    fn handshake_ack_uses_camel_case_payload() {
        let ack = SignalingMessage::HandshakeAck(HandshakeAckPayload::for_client(&ClientId::from(
            "c1",
        )));
        let value: serde_json::Value =
            serde_json::from_str(&ack.encode().expect("encodes")).expect("valid json");
        assert_eq!(value["type"], "handshake-ack");
        assert_eq!(value["payload"]["clientId"], "c1");
        assert_eq!(
            value["payload"]["message"],
            "Handshake acknowledged for client c1"
        );
    }

    #[test]
    fn candidate_fields_follow_browser_names() {
        let text = json!({
            "type": "candidate",
            "payload": { "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            } }
        })
        .to_string();
        let SignalingMessage::Candidate(payload) =
            SignalingMessage::decode(&text).expect("candidate decodes")
        else {
            panic!("expected candidate");
        };
        assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.candidate.sdp_mline_index, Some(0));
        assert_eq!(payload.candidate.username_fragment.as_deref(), Some("abcd"));
        assert!(!payload.candidate.is_end_of_candidates());
    }

    #[test]
    fn null_and_empty_candidates_mean_end_of_candidates() {
        let null = json!({ "type": "candidate", "payload": { "candidate": null } }).to_string();
        let empty = json!({ "type": "candidate", "payload": { "candidate": { "candidate": "" } } })
            .to_string();
        for text in [null, empty] {
            let SignalingMessage::Candidate(payload) =
                SignalingMessage::decode(&text).expect("candidate decodes")
            else {
                panic!("expected candidate");
            };
            assert!(payload.candidate.is_end_of_candidates());
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        let text = json!({ "type": "video-frame", "payload": { "data": [1, 2, 3] } }).to_string();
        assert!(matches!(
            SignalingMessage::decode(&text),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_payload_that_does_not_match_tag() {
        let text = json!({
            "type": "offer",
            "payload": { "candidate": { "candidate": "candidate:1" } }
        })
        .to_string();
        assert!(matches!(
            SignalingMessage::decode(&text),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_offer_tag_carrying_answer_description() {
        let text = json!({
            "type": "offer",
            "payload": { "sdp": { "type": "answer", "sdp": "v=0\r\n" } }
        })
        .to_string();
        assert!(matches!(
            SignalingMessage::decode(&text),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_offer_without_sdp_body() {
        let text = json!({ "type": "offer", "payload": { "sdp": { "type": "offer" } } }).to_string();
        assert!(matches!(
            SignalingMessage::decode(&text),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
