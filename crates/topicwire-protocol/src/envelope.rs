use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{MAX_PAYLOAD_SIZE, PROTOCOL_ID},
    error::ProtocolError,
    TopicId,
};

/// One protocol operation, tagged by the `op` field of the JSON payload.
///
/// Each variant carries exactly the fields that operation defines; a
/// payload is parsed into this enum once, at ingestion, and never
/// re-inspected as raw JSON downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Requester -> responder, on the responder's inbound topic:
    /// "open a dedicated conversation channel with me".
    ConnectionRequest {
        /// Account id of the requesting party.
        requester: String,
    },

    /// Responder -> requester, on the responder's outbound topic:
    /// "your request was accepted, here is the dedicated channel".
    ConnectionCreated {
        /// Sequence number of the `connection_request` entry being
        /// answered. The requester matches on this.
        connection_id: u64,
        /// The newly created dedicated connection topic.
        connection_topic: TopicId,
        requester: String,
        responder: String,
        /// Present when writes to the connection topic carry a
        /// per-message fee. The requester mirrors these terms; they are
        /// the responder's configuration, not the requester's.
        #[serde(skip_serializing_if = "Option::is_none")]
        fee: Option<FeeTerms>,
    },

    /// Conversational payload on a connection topic.
    ///
    /// A request sets `response_id` (the id a matching response must echo);
    /// a response sets `correlation_id` (the echoed id). A message with
    /// neither is a plain one-way payload.
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        data: String,
    },

    /// Either side, on a connection topic: "this channel is done".
    CloseConnection {
        reason: String,
        close_method: CloseMethod,
    },
}

impl Operation {
    /// Wire name of this operation (matches the serialized `op` tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionRequest { .. } => "connection_request",
            Self::ConnectionCreated { .. } => "connection_created",
            Self::Message { .. } => "message",
            Self::CloseConnection { .. } => "close_connection",
        }
    }

    /// Returns true for operations that drive the handshake state machine
    /// (as opposed to conversational traffic).
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Message { .. })
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fee terms advertised in a `connection_created` announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTerms {
    /// Per-message amount, smallest ledger denomination.
    pub amount: u64,
    /// Account the fee is paid to.
    pub collector: String,
}

/// Who initiated a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMethod {
    RequesterRequest,
    ResponderRequest,
    Expired,
}

/// The JSON payload envelope appended to ledger topics.
///
/// Wire shape: `{"p":"conn-v1","op":"...","...op fields...","m":...,
/// "created_ms":...}`. The `op` tag and its fields are flattened into the
/// top-level object, matching what counterparty implementations emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol identifier; must equal [`PROTOCOL_ID`].
    #[serde(rename = "p")]
    pub protocol: String,
    #[serde(flatten)]
    pub operation: Operation,
    /// Optional human-readable memo (ignored by classification).
    #[serde(rename = "m", skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Sender wall-clock creation time, unix milliseconds.
    pub created_ms: u64,
}

impl Envelope {
    pub fn new(operation: Operation) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_string(),
            operation,
            memo: None,
            created_ms: now_ms(),
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Serialize to the JSON wire form, enforcing the payload size cap.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)
            .map_err(|e| ProtocolError::PayloadEncode(e.to_string()))?;
        if json.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: json.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(json)
    }

    /// Parse a raw ledger payload. Rejects foreign protocols so a topic
    /// shared with other standards never feeds junk into the state machine.
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        let env: Envelope = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::PayloadDecode(e.to_string()))?;
        if env.protocol != PROTOCOL_ID {
            return Err(ProtocolError::UnsupportedProtocol(env.protocol));
        }
        Ok(env)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh correlation id for an outbound request expecting a response.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_connection_request() {
        let env = Envelope::new(Operation::ConnectionRequest {
            requester: "0.0.1001".into(),
        })
        .with_memo("hello");
        let json = env.encode().unwrap();
        let back = Envelope::decode(&json).unwrap();
        assert_eq!(env, back);
        assert_eq!(back.operation.name(), "connection_request");
    }

    #[test]
    fn op_tag_is_flattened() {
        let env = Envelope::new(Operation::CloseConnection {
            reason: "done".into(),
            close_method: CloseMethod::RequesterRequest,
        });
        let json = env.encode().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(raw["p"], "conn-v1");
        assert_eq!(raw["op"], "close_connection");
        assert_eq!(raw["close_method"], "requester_request");
    }

    #[test]
    fn message_request_and_response_shapes() {
        let rid = new_correlation_id();
        let req = Envelope::new(Operation::Message {
            correlation_id: None,
            response_id: Some(rid.clone()),
            data: "what is the weather".into(),
        });
        let resp = Envelope::new(Operation::Message {
            correlation_id: Some(rid.clone()),
            response_id: None,
            data: "sunny".into(),
        });
        let req_raw: serde_json::Value =
            serde_json::from_str(&req.encode().unwrap()).unwrap();
        assert_eq!(req_raw["response_id"], rid.as_str());
        assert!(req_raw.get("correlation_id").is_none());
        let resp_raw: serde_json::Value =
            serde_json::from_str(&resp.encode().unwrap()).unwrap();
        assert_eq!(resp_raw["correlation_id"], rid.as_str());
    }

    #[test]
    fn connection_created_carries_responder_fee_terms() {
        let env = Envelope::new(Operation::ConnectionCreated {
            connection_id: 6,
            connection_topic: "0.0.5005".into(),
            requester: "0.0.1001".into(),
            responder: "0.0.2002".into(),
            fee: Some(FeeTerms {
                amount: 100,
                collector: "0.0.7777".into(),
            }),
        });
        let raw: serde_json::Value =
            serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(raw["fee"]["amount"], 100);
        assert_eq!(raw["fee"]["collector"], "0.0.7777");

        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back.operation, env.operation);
    }

    #[test]
    fn connection_created_fee_is_optional_on_the_wire() {
        let json = r#"{"p":"conn-v1","op":"connection_created","connection_id":6,
            "connection_topic":"0.0.5005","requester":"0.0.1001",
            "responder":"0.0.2002","created_ms":1}"#;
        let env = Envelope::decode(json).unwrap();
        match env.operation {
            Operation::ConnectionCreated { fee, .. } => assert_eq!(fee, None),
            ref other => panic!("unexpected operation {other}"),
        }
    }

    #[test]
    fn foreign_protocol_rejected() {
        let json = r#"{"p":"hcs-2","op":"message","data":"x","created_ms":1}"#;
        assert!(matches!(
            Envelope::decode(json),
            Err(ProtocolError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn unknown_op_rejected() {
        let json = r#"{"p":"conn-v1","op":"teleport","created_ms":1}"#;
        assert!(matches!(
            Envelope::decode(json),
            Err(ProtocolError::PayloadDecode(_))
        ));
    }

    #[test]
    fn non_json_rejected() {
        assert!(Envelope::decode("not json at all").is_err());
    }
}
