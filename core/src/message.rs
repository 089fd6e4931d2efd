use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::IntakeError;

pub const HEADER_COMPANY_ID: &str = "CompanyId";
pub const HEADER_MESSAGE_TYPE: &str = "MessageType";
pub const HEADER_SENDER_ID: &str = "SenderId";

/// Business message kinds the queue carries. Anything else is rejected at
/// intake before window assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Order,
    Payment,
    Shipment,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ORDER" => Some(MessageType::Order),
            "PAYMENT" => Some(MessageType::Payment),
            "SHIPMENT" => Some(MessageType::Shipment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Order => "ORDER",
            MessageType::Payment => "PAYMENT",
            MessageType::Shipment => "SHIPMENT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queue record that passed the intake gate, together with the position it
/// was read from. Owned by the window assigner until it lands in a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub payload: String,
    pub headers: HashMap<String, String>,
    pub company_id: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub partition: i32,
    pub offset: i64,
}

impl InboundMessage {
    /// Gate a raw queue record. Empty payloads, missing headers and unknown
    /// message types never make it into the pipeline.
    pub fn from_parts(
        payload: String,
        headers: HashMap<String, String>,
        partition: i32,
        offset: i64,
    ) -> std::result::Result<Self, IntakeError> {
        if payload.trim().is_empty() {
            return Err(IntakeError::EmptyPayload);
        }

        let company_id = required_header(&headers, HEADER_COMPANY_ID)?;
        let raw_type = required_header(&headers, HEADER_MESSAGE_TYPE)?;
        let sender_id = required_header(&headers, HEADER_SENDER_ID)?;

        let message_type = MessageType::parse(&raw_type)
            .ok_or_else(|| IntakeError::UnknownMessageType(raw_type.clone()))?;

        Ok(Self {
            payload,
            headers,
            company_id,
            message_type,
            sender_id,
            partition,
            offset,
        })
    }
}

fn required_header(
    headers: &HashMap<String, String>,
    name: &'static str,
) -> std::result::Result<String, IntakeError> {
    match headers.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(IntakeError::MissingHeader(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(company: &str, kind: &str, sender: &str) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert(HEADER_COMPANY_ID.to_string(), company.to_string());
        h.insert(HEADER_MESSAGE_TYPE.to_string(), kind.to_string());
        h.insert(HEADER_SENDER_ID.to_string(), sender.to_string());
        h
    }

    #[test]
    fn accepts_well_formed_message() {
        let msg = InboundMessage::from_parts(
            "<order/>".to_string(),
            headers("COMP000001", "ORDER", "SENDER001"),
            0,
            42,
        )
        .unwrap();

        assert_eq!(msg.company_id, "COMP000001");
        assert_eq!(msg.message_type, MessageType::Order);
        assert_eq!(msg.sender_id, "SENDER001");
        assert_eq!(msg.offset, 42);
    }

    #[test]
    fn rejects_empty_payload() {
        let err = InboundMessage::from_parts(
            "  ".to_string(),
            headers("COMP000001", "ORDER", "SENDER001"),
            0,
            0,
        )
        .unwrap_err();
        assert_eq!(err, IntakeError::EmptyPayload);
    }

    #[test]
    fn rejects_missing_or_empty_headers() {
        let mut h = headers("COMP000001", "ORDER", "SENDER001");
        h.remove(HEADER_SENDER_ID);
        let err = InboundMessage::from_parts("<order/>".to_string(), h, 0, 0).unwrap_err();
        assert_eq!(err, IntakeError::MissingHeader(HEADER_SENDER_ID));

        let err = InboundMessage::from_parts(
            "<order/>".to_string(),
            headers("", "ORDER", "SENDER001"),
            0,
            0,
        )
        .unwrap_err();
        assert_eq!(err, IntakeError::MissingHeader(HEADER_COMPANY_ID));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let err = InboundMessage::from_parts(
            "<order/>".to_string(),
            headers("COMP000001", "UNKNOWN", "SENDER001"),
            0,
            0,
        )
        .unwrap_err();
        assert_eq!(err, IntakeError::UnknownMessageType("UNKNOWN".to_string()));
    }

    #[test]
    fn payment_and_shipment_pass_intake() {
        for kind in ["PAYMENT", "SHIPMENT"] {
            let msg = InboundMessage::from_parts(
                "<payment/>".to_string(),
                headers("COMP000001", kind, "SENDER001"),
                0,
                0,
            )
            .unwrap();
            assert_eq!(msg.message_type.as_str(), kind);
        }
    }
}
