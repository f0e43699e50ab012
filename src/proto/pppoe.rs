//! PPPoE decoder (RFC 2516).

use super::{ensure_len, Decoder, DissectContext, Dissection, LayerInfo, ProcessContext, Protocol};
use crate::conntrack::{ConntrackKey, NoFlow};
use crate::error::ParseError;

const HEADER_LEN: usize = 6;
const VERSION_TYPE: u8 = 0x11;

const CODE_SESSION: u8 = 0x00;
const CODE_PADT: u8 = 0xa7;

/// Session frames are tracked per session id and station pair; a PADT
/// closes the session.
#[derive(Debug, Default)]
pub struct PppoeDecoder;

impl PppoeDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PppoeDecoder {
    type Flow = NoFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Pppoe
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, HEADER_LEN)?;
        let data = cx.data;
        if data[0] != VERSION_TYPE {
            return Err(ParseError::UnsupportedVersion(data[0]));
        }
        let code = data[1];
        let session = u16::from_be_bytes([data[2], data[3]]);
        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if HEADER_LEN + length > data.len() {
            return Err(ParseError::InvalidLength {
                field: "pppoe_length",
                value: length,
            });
        }

        let dissection = Dissection::new(LayerInfo::Pppoe { code, session }, HEADER_LEN)
            .with_payload_len(length);

        match code {
            CODE_SESSION | CODE_PADT => {
                let (src, dst) = cx
                    .stack
                    .ethernet_addresses()
                    .ok_or(ParseError::MissingLayer("ethernet"))?;
                let key = ConntrackKey::session(session, src, dst);
                Ok(if code == CODE_SESSION {
                    dissection.with_key(key).with_next(Protocol::Ppp)
                } else {
                    dissection.with_existing_key(key)
                })
            }
            _ => Ok(dissection),
        }
    }

    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        _flow: Option<&mut NoFlow>,
    ) -> Result<(), ParseError> {
        if let Some(LayerInfo::Pppoe {
            code: CODE_PADT, ..
        }) = cx.stack().last().map(|layer| &layer.info)
        {
            cx.close_conntrack();
        }
        Ok(())
    }
}
