//! TFTP file analyzer: reassembles transferred files into the payload
//! store.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::{require, Analyzer, Upstream};
use crate::conntrack::{AnalyzerId, Attachment};
use crate::content::ContentDecoders;
use crate::error::{AnalyzerError, ListenerError, PayloadError};
use crate::event::{
    Event, EventBus, EventContext, EventDef, EventListener, FieldSpec, FieldType, ListenerWatch,
};
use crate::payload::{mime_type_for, PayloadStore, StoredPayload};
use crate::proto::{TFTP_DATA, TFTP_REQUEST};
use crate::registry::Counters;

pub const TFTP_FILE: &str = "tftp_file";

const ID: AnalyzerId = AnalyzerId::new("tftp_file");

/// Reassembly state of one transfer.
struct TransferState {
    filename: String,
    mode: String,
    write: bool,
    client: SocketAddr,
    server: IpAddr,
    content: BytesMut,
    next_block: u16,
    broken: bool,
    /// Held until the transfer's conntrack closes.
    stored: Option<StoredPayload>,
}

impl Attachment for TransferState {
    fn cleanup(&mut self) {
        if self.stored.is_none() {
            debug!(
                filename = %self.filename,
                received = self.content.len(),
                "tftp transfer closed before completion"
            );
        }
    }
}

struct CompletedFile {
    filename: String,
    mode: String,
    write: bool,
    client: SocketAddr,
    server: IpAddr,
    content: Bytes,
}

pub struct TftpFileAnalyzer {
    me: Weak<TftpFileAnalyzer>,
    upstream: Upstream,
    file: EventDef,
    store: Arc<dyn PayloadStore>,
    decoders: ContentDecoders,
    counters: Arc<Counters>,
}

impl TftpFileAnalyzer {
    pub fn new(
        bus: &EventBus,
        store: Arc<dyn PayloadStore>,
        decoders: ContentDecoders,
        counters: Arc<Counters>,
    ) -> Result<Arc<Self>, AnalyzerError> {
        let inputs = vec![
            require(bus, ID.name(), TFTP_REQUEST)?,
            require(bus, ID.name(), TFTP_DATA)?,
        ];
        let file = bus.register_definition(
            TFTP_FILE,
            1,
            vec![
                FieldSpec::new("filename", FieldType::String, "Transferred file"),
                FieldSpec::new("mode", FieldType::String, "Transfer mode"),
                FieldSpec::new("write", FieldType::Bool, "Uploaded to the server"),
                FieldSpec::new("size", FieldType::U64, "Size after decoding"),
                FieldSpec::new("payload_id", FieldType::U64, "Payload store id"),
                FieldSpec::new("client", FieldType::Ip, "Client address"),
                FieldSpec::new("server", FieldType::Ip, "Server address"),
            ],
        )?;

        let outputs = vec![file.clone()];
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            upstream: Upstream::new(ID, inputs, outputs),
            file,
            store,
            decoders,
            counters,
        }))
    }

    fn on_request(&self, event: &Event, cx: &mut EventContext<'_>) -> Result<(), ListenerError> {
        let Some(transfer) = cx.conntrack_mut() else {
            trace!("tftp request without a transfer");
            return Ok(());
        };
        let client_ip = event.get_ip("client").ok_or(ListenerError::MissingField("client"))?;
        let client_port = event
            .get_u64("client_port")
            .ok_or(ListenerError::MissingField("client_port"))?;
        let server = event.get_ip("server").ok_or(ListenerError::MissingField("server"))?;

        let state = TransferState {
            filename: event.get_str("filename").unwrap_or_default().to_string(),
            mode: event.get_str("mode").unwrap_or_default().to_string(),
            write: event.get_bool("write").unwrap_or(false),
            client: SocketAddr::new(client_ip, client_port as u16),
            server,
            content: BytesMut::new(),
            next_block: 1,
            broken: false,
            stored: None,
        };
        transfer.attach(ID, state);
        Ok(())
    }

    /// Append one block. Returns the file once the last block arrived.
    fn on_data(
        &self,
        event: &Event,
        cx: &mut EventContext<'_>,
    ) -> Result<Option<CompletedFile>, ListenerError> {
        let Some(state) = cx
            .conntrack_mut()
            .and_then(|transfer| transfer.attachment_mut::<TransferState>(ID))
        else {
            trace!("tftp data without a request");
            return Ok(None);
        };
        if state.broken || state.stored.is_some() {
            return Ok(None);
        }

        let block = event.get_u64("block").ok_or(ListenerError::MissingField("block"))? as u16;
        if block != state.next_block {
            debug!(
                filename = %state.filename,
                expected = state.next_block,
                block,
                "tftp block missing, giving up on file"
            );
            state.broken = true;
            return Ok(None);
        }
        let payload = event
            .get_bytes("payload")
            .ok_or(ListenerError::MissingField("payload"))?;
        let requested = (state.content.len() + payload.len()) as u64;
        if let Some(available) = self.store.available().filter(|available| requested > *available) {
            debug!(
                filename = %state.filename,
                requested,
                available,
                "tftp file does not fit the payload store, giving up on file"
            );
            state.broken = true;
            state.content = BytesMut::new();
            return Err(PayloadError::CapacityExceeded {
                requested,
                available,
            }
            .into());
        }
        state.content.extend_from_slice(payload);
        state.next_block = block.wrapping_add(1);

        if !event.get_bool("last").unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(CompletedFile {
            filename: state.filename.clone(),
            mode: state.mode.clone(),
            write: state.write,
            client: state.client,
            server: state.server,
            content: std::mem::take(&mut state.content).freeze(),
        }))
    }

    fn store(&self, file: &CompletedFile) -> Result<StoredPayload, ListenerError> {
        let content = if file.mode == "netascii" {
            self.decoders
                .decode("netascii", &file.content)
                .map_err(|e| ListenerError::Failed(e.to_string()))?
        } else {
            file.content.clone()
        };
        let stored = self.store.store(content, mime_type_for(&file.filename))?;
        self.counters.payloads_stored.inc();
        Ok(stored)
    }
}

impl EventListener for TftpFileAnalyzer {
    fn name(&self) -> &str {
        ID.name()
    }

    fn on_event(&self, event: &Event, cx: &mut EventContext<'_>) -> Result<(), ListenerError> {
        if event.name() == TFTP_REQUEST {
            return self.on_request(event, cx);
        }

        let Some(file) = self.on_data(event, cx)? else {
            return Ok(());
        };
        let stored = self.store(&file)?;
        debug!(
            filename = %file.filename,
            size = stored.len(),
            payload = %stored.id,
            "tftp file stored"
        );

        let output = Event::new(&self.file, event.timestamp())
            .with("filename", file.filename)?
            .with("mode", file.mode)?
            .with("write", file.write)?
            .with("size", stored.len() as u64)?
            .with("payload_id", stored.id.get())?
            .with("client", file.client.ip())?
            .with("server", file.server)?;

        if let Some(state) = cx
            .conntrack_mut()
            .and_then(|transfer| transfer.attachment_mut::<TransferState>(ID))
        {
            state.stored = Some(stored);
        }
        cx.emit(output)
            .map_err(|e| ListenerError::Failed(e.to_string()))?;
        Ok(())
    }
}

impl ListenerWatch for TftpFileAnalyzer {
    fn listeners_changed(&self, bus: &EventBus, definition: &EventDef, has_listeners: bool) {
        if let Some(me) = self.me.upgrade() {
            self.upstream.output_changed(bus, me, definition, has_listeners);
        }
    }
}

impl Analyzer for TftpFileAnalyzer {
    fn id(&self) -> AnalyzerId {
        ID
    }

    fn start(&self, bus: &EventBus) -> Result<(), AnalyzerError> {
        if let Some(me) = self.me.upgrade() {
            self.upstream.start(bus, me);
        }
        Ok(())
    }

    fn stop(&self, bus: &EventBus) {
        self.upstream.stop(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::packet::{InputId, LinkType, Packet, Timestamp};
    use crate::payload::MemoryPayloadStore;
    use crate::proto::{Expectations, Protocol, ProtocolRegistry};
    use crate::testutil;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    struct Fixture {
        bus: Arc<EventBus>,
        dispatcher: Dispatcher,
        store: Arc<MemoryPayloadStore>,
        counters: Arc<Counters>,
    }

    fn fixture(capacity: u64) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(
            ProtocolRegistry::with_defaults(&bus, Arc::new(Expectations::new()), 64).unwrap(),
        );
        let counters = Arc::new(Counters::new().unwrap());
        let dispatcher = Dispatcher::new(registry, bus.clone(), counters.clone(), 16);
        let store = Arc::new(MemoryPayloadStore::new(capacity));
        let analyzer = TftpFileAnalyzer::new(
            &bus,
            store.clone(),
            ContentDecoders::default(),
            counters.clone(),
        )
        .unwrap();
        analyzer.start(&bus).unwrap();
        Fixture {
            bus,
            dispatcher,
            store,
            counters,
        }
    }

    struct Files(Mutex<Vec<Event>>);

    impl EventListener for Files {
        fn name(&self) -> &str {
            "files"
        }

        fn on_event(&self, event: &Event, _: &mut EventContext<'_>) -> Result<(), ListenerError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    fn listen(fx: &Fixture) -> Arc<Files> {
        let files = Arc::new(Files(Mutex::new(Vec::new())));
        fx.bus
            .subscribe(&fx.bus.definition(TFTP_FILE).unwrap(), files.clone());
        files
    }

    fn send(fx: &Fixture, from_client: bool, payload: Vec<u8>, millis: u64) -> crate::dispatch::ProcessReport {
        let (src, dst) = if from_client {
            ((CLIENT, 3000), (SERVER, if payload[1] == 1 { 69 } else { 40000 }))
        } else {
            ((SERVER, 40000), (CLIENT, 3000))
        };
        let frame = testutil::ethernet_ipv4_udp(src, dst, &payload);
        fx.dispatcher
            .process(&Packet::new(frame, Timestamp::from_millis(millis), InputId(0), LinkType::Ethernet))
    }

    fn transfer(fx: &Fixture, filename: &str, mode: &str, blocks: &[&[u8]]) -> Vec<crate::dispatch::ProcessReport> {
        let mut reports = vec![send(fx, true, testutil::tftp_rrq(filename, mode), 0)];
        for (i, block) in blocks.iter().enumerate() {
            let n = (i + 1) as u16;
            reports.push(send(fx, false, testutil::tftp_data(n, block), 10 * u64::from(n)));
            reports.push(send(fx, true, testutil::tftp_ack(n), 10 * u64::from(n) + 5));
        }
        reports
    }

    #[test]
    fn test_file_reassembled_and_stored() {
        let fx = fixture(1 << 20);
        let files = listen(&fx);
        let first = vec![b'a'; 512];
        transfer(&fx, "pxelinux.0", "octet", &[&first, b"tail"]);

        let events = files.0.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.get_str("filename"), Some("pxelinux.0"));
        assert_eq!(event.get_u64("size"), Some(516));
        assert_eq!(event.get_bool("write"), Some(false));
        assert_eq!(event.get_ip("client"), Some(CLIENT.into()));
        assert_eq!(event.get_ip("server"), Some(SERVER.into()));

        let id = crate::payload::PayloadId::new(event.get_u64("payload_id").unwrap());
        let mut reader = fx.store.open(id).unwrap();
        assert_eq!(reader.mime_type(), "binary/octet-stream");
        let content = reader.read(1024).unwrap();
        assert_eq!(&content[..512], &first[..]);
        assert_eq!(&content[512..], b"tail");
        assert_eq!(fx.counters.payloads_stored.get(), 1);

        // Final ACK closed the transfer.
        let tftp = fx.dispatcher.registry().conntracks(Protocol::Tftp).unwrap();
        assert!(tftp.is_empty());
    }

    #[test]
    fn test_netascii_converted() {
        let fx = fixture(1 << 20);
        let files = listen(&fx);
        transfer(&fx, "motd.txt", "netascii", &[b"hello\r\nworld\r\n"]);

        let events = files.0.lock();
        let id = crate::payload::PayloadId::new(events[0].get_u64("payload_id").unwrap());
        let content = fx.store.open(id).unwrap().read(64).unwrap();
        assert_eq!(&content[..], b"hello\nworld\n");
        assert_eq!(events[0].get_u64("size"), Some(12));
    }

    #[test]
    fn test_no_listener_no_payload_writes() {
        let fx = fixture(1 << 20);
        let request = fx.bus.definition(TFTP_REQUEST).unwrap();
        transfer(&fx, "boot.img", "octet", &[b"short"]);

        assert!(!request.has_subscribers());
        assert_eq!(fx.store.len(), 0);
        assert_eq!(fx.counters.payloads_stored.get(), 0);
    }

    #[test]
    fn test_capacity_exceeded_is_listener_failure() {
        let fx = fixture(4);
        let files = listen(&fx);
        let reports = transfer(&fx, "big.bin", "octet", &[b"too large"]);

        assert!(files.0.lock().is_empty());
        assert_eq!(reports[1].listener_failures, 1);
        assert_eq!(fx.counters.listener_failures.get(), 1);
        assert!(matches!(
            fx.store.store(Bytes::from_static(b"12345"), "x"),
            Err(PayloadError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_oversized_transfer_stops_buffering() {
        let fx = fixture(600);
        let files = listen(&fx);
        let block = vec![b'x'; 512];
        send(&fx, true, testutil::tftp_rrq("huge.iso", "octet"), 0);
        assert_eq!(send(&fx, false, testutil::tftp_data(1, &block), 10).listener_failures, 0);
        send(&fx, true, testutil::tftp_ack(1), 15);
        assert_eq!(send(&fx, false, testutil::tftp_data(2, &block), 20).listener_failures, 1);
        assert_eq!(send(&fx, false, testutil::tftp_data(3, b"end"), 30).listener_failures, 0);

        assert!(files.0.lock().is_empty());
        assert_eq!(fx.store.len(), 0);

        let key = crate::conntrack::ConntrackKey::transfer(
            SocketAddr::new(CLIENT.into(), 3000),
            SERVER.into(),
        );
        let handle = fx
            .dispatcher
            .registry()
            .conntracks(Protocol::Tftp)
            .unwrap()
            .lookup(&key)
            .unwrap();
        let entry = handle.lock();
        let state = entry.attachment::<TransferState>(ID).unwrap();
        assert!(state.broken);
        assert!(state.content.is_empty());
    }

    #[test]
    fn test_missing_block_abandons_file() {
        let fx = fixture(1 << 20);
        let files = listen(&fx);
        send(&fx, true, testutil::tftp_rrq("gap.bin", "octet"), 0);
        send(&fx, false, testutil::tftp_data(1, &[0u8; 512]), 10);
        send(&fx, false, testutil::tftp_data(3, b"end"), 20);

        assert!(files.0.lock().is_empty());
        assert_eq!(fx.store.len(), 0);
    }
}
