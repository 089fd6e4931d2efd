use quick_xml::Reader;
use quick_xml::events::Event;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::message::{InboundMessage, MessageType};

/// An order record decoded from a message payload. Timestamps are assigned by
/// the persistence sink, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedOrder {
    pub order_id: String,
    pub company_id: String,
    pub customer_name: String,
    pub total_amount: Option<Decimal>,
    pub status: String,
}

/// Turns one raw message into a typed order. Stateless and swappable; the
/// wire format is an implementation detail of the concrete decoder.
pub trait OrderDecoder: Send + Sync {
    fn decode(&self, message: &InboundMessage) -> std::result::Result<ParsedOrder, DecodeError>;
}

/// Decoder for the `<order>` XML documents the trading partners submit.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlOrderDecoder;

impl OrderDecoder for XmlOrderDecoder {
    fn decode(&self, message: &InboundMessage) -> std::result::Result<ParsedOrder, DecodeError> {
        if message.message_type != MessageType::Order {
            return Err(DecodeError::UnsupportedMessageType(message.message_type));
        }

        let mut reader = Reader::from_str(&message.payload);
        reader.config_mut().trim_text(true);

        let mut order_id: Option<String> = None;
        let mut company_id = String::new();
        let mut customer_name = String::new();
        let mut raw_amount: Option<String> = None;
        let mut status = String::new();
        let mut current: Option<Vec<u8>> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => current = Some(e.name().as_ref().to_vec()),
                Ok(Event::End(_)) => current = None,
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| DecodeError::Malformed {
                            reason: e.to_string(),
                        })?
                        .into_owned();
                    match current.as_deref() {
                        Some(b"orderId") => order_id = Some(text),
                        Some(b"companyId") => company_id = text,
                        Some(b"customerName") => customer_name = text,
                        Some(b"totalAmount") => raw_amount = Some(text),
                        Some(b"orderStatus") => status = text,
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(DecodeError::Malformed {
                        reason: e.to_string(),
                    });
                }
            }
        }

        let order_id = order_id.ok_or(DecodeError::MissingField { field: "orderId" })?;

        let total_amount = match raw_amount {
            Some(raw) => Some(
                raw.parse::<Decimal>()
                    .map_err(|_| DecodeError::InvalidAmount { raw })?,
            ),
            None => None,
        };

        Ok(ParsedOrder {
            order_id,
            company_id,
            customer_name,
            total_amount,
            status,
        })
    }
}
