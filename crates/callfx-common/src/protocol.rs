//! Signaling wire format shared by peers and the relay.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a generated participant id.
pub const PARTICIPANT_ID_LEN: usize = 6;

const ID_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";

/// Short-lived identity of one running instance.
///
/// Generated at startup and never persisted; two runs of the same install get
/// different ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id for this process.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..PARTICIPANT_ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect::<String>();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    IncomingCall,
    AcceptCall,
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    /// Whether this kind carries a payload in `data`.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Ice)
    }
}

/// One signaling message, as stored in a participant's slot.
///
/// `participant_id` is the *sender*; the slot it is written into identifies
/// the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "participantId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub data: Option<String>,
}

impl SignalEnvelope {
    pub fn incoming_call(sender: ParticipantId) -> Self {
        Self {
            participant_id: sender,
            kind: SignalKind::IncomingCall,
            data: None,
        }
    }

    pub fn accept_call(sender: ParticipantId) -> Self {
        Self {
            participant_id: sender,
            kind: SignalKind::AcceptCall,
            data: None,
        }
    }

    pub fn offer(sender: ParticipantId, sdp: impl Into<String>) -> Self {
        Self {
            participant_id: sender,
            kind: SignalKind::Offer,
            data: Some(sdp.into()),
        }
    }

    pub fn answer(sender: ParticipantId, sdp: impl Into<String>) -> Self {
        Self {
            participant_id: sender,
            kind: SignalKind::Answer,
            data: Some(sdp.into()),
        }
    }

    pub fn ice(sender: ParticipantId, candidate: &IceCandidate) -> Result<Self> {
        Ok(Self {
            participant_id: sender,
            kind: SignalKind::Ice,
            data: Some(serde_json::to_string(candidate)?),
        })
    }

    /// Serialize to the flat JSON form stored in the channel.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the flat JSON form stored in the channel.
    pub fn decode(raw: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(raw)?;
        if envelope.participant_id.is_empty() {
            return Err(Error::serialization("envelope without sender id"));
        }
        Ok(envelope)
    }

    /// SDP text of an Offer/Answer envelope.
    pub fn sdp(&self) -> Result<&str> {
        match (self.kind, self.data.as_deref()) {
            (SignalKind::Offer | SignalKind::Answer, Some(sdp)) if !sdp.trim().is_empty() => {
                Ok(sdp)
            }
            (SignalKind::Offer | SignalKind::Answer, _) => {
                Err(Error::serialization("session description payload is empty"))
            }
            (kind, _) => Err(Error::serialization(format!(
                "{kind:?} envelope carries no session description"
            ))),
        }
    }

    /// ICE candidate carried by an Ice envelope.
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        if self.kind != SignalKind::Ice {
            return Err(Error::serialization(format!(
                "{:?} envelope carries no ICE candidate",
                self.kind
            )));
        }
        let raw = self
            .data
            .as_deref()
            .ok_or_else(|| Error::serialization("ICE payload is missing"))?;
        let candidate: IceCandidate = serde_json::from_str(raw)?;
        if candidate.candidate.trim().is_empty() {
            return Err(Error::serialization("ICE candidate line is empty"));
        }
        Ok(candidate)
    }
}

/// Trickle ICE candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Largest slot value the relay accepts.
pub const MAX_RELAY_VALUE_BYTES: usize = 64 * 1024;

/// Client → relay request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum RelayRequest {
    /// Receive pushes for a participant's slot.
    SUBSCRIBE {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },

    /// Overwrite a participant's slot.
    WRITE {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
        value: String,
    },

    /// Empty a participant's slot.
    CLEAR {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },
}

/// Relay → client push.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum RelayPush {
    /// Current value of a subscribed slot (`None` once cleared).
    VALUE {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
        value: Option<String>,
    },

    /// Request rejected by the relay.
    ERROR { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let env = SignalEnvelope::incoming_call(ParticipantId::from("ab12"));
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["participantId"], "ab12");
        assert_eq!(json["type"], "INCOMING_CALL");
        assert!(json["data"].is_null());
    }

    #[test]
    fn test_decode_accepts_missing_data() {
        let env = SignalEnvelope::decode(r#"{"participantId":"zz","type":"ACCEPT_CALL"}"#).unwrap();
        assert_eq!(env.kind, SignalKind::AcceptCall);
        assert_eq!(env.data, None);
    }

    #[test]
    fn test_decode_rejects_unknown_kind_and_blank_sender() {
        assert!(SignalEnvelope::decode(r#"{"participantId":"zz","type":"HANGUP"}"#).is_err());
        assert!(SignalEnvelope::decode(r#"{"participantId":" ","type":"OFFER"}"#).is_err());
        assert!(SignalEnvelope::decode("not json").is_err());
    }

    #[test]
    fn test_ice_payload_roundtrip_uses_camel_case() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let env = SignalEnvelope::ice(ParticipantId::from("me"), &candidate).unwrap();
        assert!(env.data.as_deref().unwrap().contains("sdpMLineIndex"));
        assert_eq!(env.ice_candidate().unwrap(), candidate);
    }

    #[test]
    fn test_malformed_ice_payload_is_rejected() {
        let env = SignalEnvelope {
            participant_id: "me".into(),
            kind: SignalKind::Ice,
            data: Some("{broken".into()),
        };
        assert!(env.ice_candidate().is_err());
    }

    #[test]
    fn test_sdp_requires_payload() {
        let env = SignalEnvelope {
            participant_id: "me".into(),
            kind: SignalKind::Offer,
            data: None,
        };
        assert!(env.sdp().is_err());
        let env = SignalEnvelope::offer("me".into(), "v=0");
        assert_eq!(env.sdp().unwrap(), "v=0");
    }

    #[test]
    fn test_generated_ids_are_short_and_distinct() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_eq!(a.as_str().len(), PARTICIPANT_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_relay_request_tagging() {
        let req = RelayRequest::WRITE {
            participant_id: "peer".into(),
            value: "{}".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"WRITE""#));
        assert!(json.contains(r#""participantId":"peer""#));
        let back: RelayRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
