//! TFTP decoder.
//!
//! Implements RFC 1350 with the option extension of RFC 2347/2348. A
//! transfer is keyed by the client endpoint and the server address, since
//! the server answers from a fresh port.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    ensure_len, Decoder, DissectContext, Dissection, Expectations, LayerInfo, ProcessContext,
    Protocol,
};
use crate::conntrack::{ConntrackKey, FlowState};
use crate::error::{EventError, ParseError};
use crate::event::{Event, EventBus, EventDef, FieldSpec, FieldType};

pub const TFTP_REQUEST: &str = "tftp_request";
pub const TFTP_DATA: &str = "tftp_data";

const SERVER_PORT: u16 = 69;
const HEADER_LEN: usize = 2;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

const DEFAULT_BLOCK_SIZE: usize = 512;
const MIN_BLOCK_SIZE: usize = 8;
const MAX_BLOCK_SIZE: usize = 65464;

/// State of one transfer.
pub struct TftpFlow {
    expectations: Arc<Expectations>,
    client: SocketAddr,
    filename: Option<String>,
    mode: String,
    write: bool,
    requested_block_size: Option<usize>,
    block_size: usize,
    last_block: Option<u16>,
    final_block: Option<u16>,
}

impl TftpFlow {
    fn new(expectations: Arc<Expectations>, client: SocketAddr) -> Self {
        Self {
            expectations,
            client,
            filename: None,
            mode: String::new(),
            write: false,
            requested_block_size: None,
            block_size: DEFAULT_BLOCK_SIZE,
            last_block: None,
            final_block: None,
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn last_block(&self) -> Option<u16> {
        self.last_block
    }

    /// Whether the final (short) data block was seen.
    pub fn is_finished(&self) -> bool {
        self.final_block.is_some()
    }

    fn is_duplicate(&self, block: u16) -> bool {
        match self.last_block {
            Some(last) => (block.wrapping_sub(last) as i16) <= 0,
            None => false,
        }
    }
}

impl FlowState for TftpFlow {
    fn on_close(&mut self) {
        self.expectations.remove(&self.client, Protocol::Tftp);
    }
}

struct Request {
    filename: String,
    mode: String,
    options: Vec<(String, String)>,
}

/// Split a NUL-terminated string list.
fn split_strings(payload: &[u8]) -> Option<Vec<String>> {
    let (last, body) = payload.split_last()?;
    if *last != 0 {
        return None;
    }
    body.split(|b| *b == 0)
        .map(|part| std::str::from_utf8(part).ok().map(str::to_string))
        .collect()
}

fn parse_request(payload: &[u8]) -> Option<Request> {
    let mut parts = split_strings(payload)?.into_iter();
    let filename = parts.next().filter(|f| !f.is_empty())?;
    let mode = parts.next().filter(|m| !m.is_empty())?.to_lowercase();
    let options = parse_options(parts);
    Some(Request {
        filename,
        mode,
        options,
    })
}

fn parse_options(mut parts: impl Iterator<Item = String>) -> Vec<(String, String)> {
    let mut options = Vec::new();
    while let (Some(name), Some(value)) = (parts.next(), parts.next()) {
        if !name.is_empty() && !value.is_empty() {
            options.push((name.to_lowercase(), value));
        }
    }
    options
}

fn block_size_option(options: &[(String, String)]) -> Option<usize> {
    options
        .iter()
        .find(|(name, _)| name == "blksize")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .filter(|size| (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(size))
}

fn block_number(payload: &Bytes) -> Option<u16> {
    (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]))
}

pub struct TftpDecoder {
    expectations: Arc<Expectations>,
    request: EventDef,
    data: EventDef,
}

impl TftpDecoder {
    pub fn new(bus: &EventBus, expectations: Arc<Expectations>) -> Result<Self, EventError> {
        let request = bus.register_definition(
            TFTP_REQUEST,
            1,
            vec![
                FieldSpec::new("filename", FieldType::String, "Requested file"),
                FieldSpec::new("mode", FieldType::String, "Transfer mode"),
                FieldSpec::new("write", FieldType::Bool, "Write request"),
                FieldSpec::new("client", FieldType::Ip, "Client address"),
                FieldSpec::new("client_port", FieldType::U16, "Client port"),
                FieldSpec::new("server", FieldType::Ip, "Server address"),
            ],
        )?;
        let data = bus.register_definition(
            TFTP_DATA,
            1,
            vec![
                FieldSpec::new("block", FieldType::U16, "Block number"),
                FieldSpec::new("payload", FieldType::Bytes, "Block content"),
                FieldSpec::new("last", FieldType::Bool, "Final block"),
            ],
        )?;
        Ok(Self {
            expectations,
            request,
            data,
        })
    }

    /// Client endpoint and server address of the transfer a packet belongs
    /// to, if any.
    fn transfer_of(
        &self,
        opcode: u16,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Option<(SocketAddr, std::net::IpAddr)> {
        let is_request = opcode == OPCODE_RRQ || opcode == OPCODE_WRQ;
        if is_request && dst.port() == SERVER_PORT {
            return Some((src, dst.ip()));
        }
        if self.expectations.lookup(&src) == Some(Protocol::Tftp) {
            return Some((src, dst.ip()));
        }
        if self.expectations.lookup(&dst) == Some(Protocol::Tftp) {
            return Some((dst, src.ip()));
        }
        None
    }

    fn on_request(
        &self,
        cx: &mut ProcessContext<'_>,
        flow: &mut TftpFlow,
        opcode: u16,
    ) -> Result<(), ParseError> {
        let Some(request) = parse_request(cx.payload()) else {
            cx.mark_invalid();
            return Err(ParseError::Invalid("malformed tftp request".to_string()));
        };

        if flow.filename.as_deref() == Some(request.filename.as_str()) {
            trace!(filename = %request.filename, "tftp request retransmitted");
            return Ok(());
        }

        debug!(
            filename = %request.filename,
            mode = %request.mode,
            client = %flow.client,
            write = opcode == OPCODE_WRQ,
            "tftp request"
        );
        flow.requested_block_size = block_size_option(&request.options);
        flow.write = opcode == OPCODE_WRQ;
        flow.mode = request.mode;
        flow.filename = Some(request.filename);
        flow.block_size = DEFAULT_BLOCK_SIZE;
        flow.last_block = None;
        flow.final_block = None;
        self.expectations.expect(flow.client, Protocol::Tftp);

        if !self.request.has_subscribers() {
            return Ok(());
        }
        let server = cx
            .stack()
            .udp_endpoints()
            .map(|(_, dst)| dst.ip())
            .ok_or(ParseError::MissingLayer("udp"))?;
        let event = Event::new(&self.request, cx.timestamp())
            .with("filename", flow.filename.clone().unwrap_or_default())?
            .with("mode", flow.mode.as_str())?
            .with("write", flow.write)?
            .with("client", flow.client.ip())?
            .with("client_port", flow.client.port())?
            .with("server", server)?;
        cx.emit(event);
        Ok(())
    }

    fn on_data(&self, cx: &mut ProcessContext<'_>, flow: &mut TftpFlow) -> Result<(), ParseError> {
        let payload = cx.payload().clone();
        let Some(block) = block_number(&payload) else {
            cx.mark_invalid();
            return Err(ParseError::PacketTooShort {
                expected: HEADER_LEN + 2,
                actual: HEADER_LEN + payload.len(),
            });
        };

        if flow.is_duplicate(block) {
            trace!(block, "duplicate tftp data block");
            return Ok(());
        }
        if flow.final_block.is_some() {
            trace!(block, "tftp data after final block");
            return Ok(());
        }

        let content = payload.slice(2..);
        let last = content.len() < flow.block_size;
        flow.last_block = Some(block);
        if last {
            flow.final_block = Some(block);
        }

        if self.data.has_subscribers() {
            let event = Event::new(&self.data, cx.timestamp())
                .with("block", block)?
                .with("payload", content)?
                .with("last", last)?;
            cx.emit(event);
        }
        Ok(())
    }

    fn on_ack(&self, cx: &mut ProcessContext<'_>, flow: &mut TftpFlow) -> Result<(), ParseError> {
        let payload = cx.payload().clone();
        let Some(block) = block_number(&payload) else {
            cx.mark_invalid();
            return Err(ParseError::PacketTooShort {
                expected: HEADER_LEN + 2,
                actual: HEADER_LEN + payload.len(),
            });
        };
        if flow.final_block == Some(block) {
            debug!(client = %flow.client, block, "tftp transfer complete");
            cx.close_conntrack();
        }
        Ok(())
    }

    fn on_oack(&self, cx: &mut ProcessContext<'_>, flow: &mut TftpFlow) {
        let options = split_strings(cx.payload())
            .map(|parts| parse_options(parts.into_iter()))
            .unwrap_or_default();
        if let Some(size) = block_size_option(&options) {
            if flow.requested_block_size.is_some_and(|requested| size > requested) {
                debug!(size, "tftp server confirmed a larger block size than requested");
            }
            flow.block_size = size;
        }
    }
}

impl Decoder for TftpDecoder {
    type Flow = TftpFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Tftp
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, HEADER_LEN)?;
        let opcode = u16::from_be_bytes([cx.data[0], cx.data[1]]);
        if !(OPCODE_RRQ..=OPCODE_OACK).contains(&opcode) {
            return Err(ParseError::Invalid(format!("unknown tftp opcode {}", opcode)));
        }

        let (src, dst) = cx
            .stack
            .udp_endpoints()
            .ok_or(ParseError::MissingLayer("udp"))?;

        let dissection = Dissection::new(LayerInfo::Tftp { opcode }, HEADER_LEN);
        Ok(match self.transfer_of(opcode, src, dst) {
            Some((client, server)) => dissection.with_key(ConntrackKey::transfer(client, server)),
            None => dissection,
        })
    }

    fn init_flow(&self, key: &ConntrackKey) -> Option<TftpFlow> {
        match key {
            ConntrackKey::Transfer { client, .. } => {
                Some(TftpFlow::new(self.expectations.clone(), *client))
            }
            _ => None,
        }
    }

    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        flow: Option<&mut TftpFlow>,
    ) -> Result<(), ParseError> {
        let Some(flow) = flow else {
            trace!("tftp packet outside a known transfer");
            return Ok(());
        };
        let opcode = match cx.stack().last().map(|layer| &layer.info) {
            Some(LayerInfo::Tftp { opcode }) => *opcode,
            _ => return Err(ParseError::MissingLayer("tftp")),
        };

        match opcode {
            OPCODE_RRQ | OPCODE_WRQ => self.on_request(cx, flow, opcode),
            OPCODE_DATA => self.on_data(cx, flow),
            OPCODE_ACK => self.on_ack(cx, flow),
            OPCODE_OACK => {
                self.on_oack(cx, flow);
                Ok(())
            }
            OPCODE_ERROR => {
                let payload = cx.payload();
                let code = block_number(payload).unwrap_or_default();
                let message = payload
                    .get(2..)
                    .map(|m| String::from_utf8_lossy(m).trim_end_matches('\0').to_string())
                    .unwrap_or_default();
                debug!(client = %flow.client, code, %message, "tftp transfer aborted");
                cx.close_conntrack();
                Ok(())
            }
            _ => Err(ParseError::Invalid(format!("unknown tftp opcode {}", opcode))),
        }
    }
}
