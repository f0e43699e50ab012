//! PPP CHAP decoder (RFC 1994).

use tracing::trace;

use super::{ensure_len, Decoder, DissectContext, Dissection, LayerInfo, ProcessContext, Protocol};
use crate::conntrack::NoFlow;
use crate::error::{EventError, ParseError};
use crate::event::{Event, EventBus, EventDef, FieldSpec, FieldType};

pub const CHAP_CHALLENGE: &str = "ppp_chap_challenge";
pub const CHAP_RESPONSE: &str = "ppp_chap_response";
pub const CHAP_SUCCESS_FAILURE: &str = "ppp_chap_success_failure";

const HEADER_LEN: usize = 4;

const CODE_CHALLENGE: u8 = 1;
const CODE_RESPONSE: u8 = 2;
const CODE_SUCCESS: u8 = 3;
const CODE_FAILURE: u8 = 4;

/// Emits one event per CHAP packet. CHAP has no conntrack of its own; the
/// events are bound to the PPP session below.
pub struct ChapDecoder {
    challenge: EventDef,
    response: EventDef,
    success_failure: EventDef,
}

impl ChapDecoder {
    pub fn new(bus: &EventBus) -> Result<Self, EventError> {
        let value_fields = |kind: &'static str| {
            vec![
                FieldSpec::new("identifier", FieldType::U8, "Exchange identifier"),
                FieldSpec::new("value", FieldType::Bytes, kind),
                FieldSpec::new("name", FieldType::String, "Sender name"),
            ]
        };
        let challenge = bus.register_definition(CHAP_CHALLENGE, 1, value_fields("Challenge value"))?;
        let response = bus.register_definition(CHAP_RESPONSE, 1, value_fields("Response value"))?;
        let success_failure = bus.register_definition(
            CHAP_SUCCESS_FAILURE,
            1,
            vec![
                FieldSpec::new("identifier", FieldType::U8, "Exchange identifier"),
                FieldSpec::new("success", FieldType::Bool, "Authentication succeeded"),
                FieldSpec::new("message", FieldType::String, "Message"),
            ],
        )?;
        Ok(Self {
            challenge,
            response,
            success_failure,
        })
    }

    fn value_event(
        &self,
        cx: &ProcessContext<'_>,
        definition: &EventDef,
        identifier: u8,
    ) -> Result<Event, ParseError> {
        let payload = cx.payload();
        ensure_len(payload, 1)?;
        let value_len = usize::from(payload[0]);
        if payload.len() < 1 + value_len {
            return Err(ParseError::InvalidLength {
                field: "chap_value_size",
                value: value_len,
            });
        }
        let value = payload.slice(1..1 + value_len);
        let name = String::from_utf8_lossy(&payload[1 + value_len..]).into_owned();

        Ok(Event::new(definition, cx.timestamp())
            .with("identifier", identifier)?
            .with("value", value)?
            .with("name", name)?)
    }
}

impl Decoder for ChapDecoder {
    type Flow = NoFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Chap
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, HEADER_LEN)?;
        let code = cx.data[0];
        let identifier = cx.data[1];
        let length = usize::from(u16::from_be_bytes([cx.data[2], cx.data[3]]));

        if !(CODE_CHALLENGE..=CODE_FAILURE).contains(&code) {
            return Err(ParseError::Invalid(format!("unknown chap code {}", code)));
        }
        if length < HEADER_LEN || length > cx.data.len() {
            return Err(ParseError::InvalidLength {
                field: "chap_length",
                value: length,
            });
        }

        Ok(
            Dissection::new(LayerInfo::Chap { code, identifier }, HEADER_LEN)
                .with_payload_len(length - HEADER_LEN),
        )
    }

    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        _flow: Option<&mut NoFlow>,
    ) -> Result<(), ParseError> {
        let (code, identifier) = match cx.stack().last().map(|layer| &layer.info) {
            Some(LayerInfo::Chap { code, identifier }) => (*code, *identifier),
            _ => return Err(ParseError::MissingLayer("chap")),
        };

        let definition = match code {
            CODE_CHALLENGE => &self.challenge,
            CODE_RESPONSE => &self.response,
            _ => &self.success_failure,
        };
        if !definition.has_subscribers() {
            trace!(code, identifier, "no listener for chap packet");
            return Ok(());
        }

        let event = match code {
            CODE_CHALLENGE | CODE_RESPONSE => self.value_event(cx, definition, identifier)?,
            _ => {
                let message = String::from_utf8_lossy(cx.payload()).into_owned();
                Event::new(definition, cx.timestamp())
                    .with("identifier", identifier)?
                    .with("success", code == CODE_SUCCESS)?
                    .with("message", message)?
            }
        };
        cx.emit(event);
        Ok(())
    }
}
