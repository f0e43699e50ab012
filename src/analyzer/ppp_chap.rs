//! PPP CHAP analyzer.
//!
//! Correlates the challenge, response and result of one CHAP exchange on a
//! PPPoE session and emits a single event with the credentials material.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use macaddr::MacAddr6;
use tracing::{debug, trace};

use super::{require, Analyzer, Upstream};
use crate::conntrack::{AnalyzerId, Attachment};
use crate::error::{AnalyzerError, ListenerError};
use crate::event::{
    Event, EventBus, EventContext, EventDef, EventListener, FieldSpec, FieldType, ListenerWatch,
};
use crate::proto::{CHAP_CHALLENGE, CHAP_RESPONSE, CHAP_SUCCESS_FAILURE};

pub const CHAP_CHALLENGE_RESPONSE: &str = "ppp_chap_challenge_response";
pub const CHAP_MSCHAPV2: &str = "ppp_chap_mschapv2";

const ID: AnalyzerId = AnalyzerId::new("ppp_chap");

const SEEN_CHALLENGE: u8 = 0x1;
const SEEN_RESPONSE: u8 = 0x2;
const SEEN_RESULT: u8 = 0x4;
const SEEN_ALL: u8 = SEEN_CHALLENGE | SEEN_RESPONSE | SEEN_RESULT;

/// MS-CHAPv2 response value: peer challenge, reserved, NT response, flags.
const MSCHAPV2_RESPONSE_LEN: usize = 49;

/// One exchange in progress, attached to the PPPoE session.
#[derive(Debug, Default)]
struct ChapExchange {
    seen: u8,
    identifier: u8,
    challenge: Bytes,
    response: Bytes,
    username: String,
    success: bool,
    stations: Option<(MacAddr6, MacAddr6)>,
}

impl Attachment for ChapExchange {
    fn cleanup(&mut self) {
        if self.seen != SEEN_ALL {
            debug!(
                identifier = self.identifier,
                seen = self.seen,
                "chap exchange abandoned"
            );
        }
    }
}

pub struct PppChapAnalyzer {
    me: Weak<PppChapAnalyzer>,
    upstream: Upstream,
    challenge_response: EventDef,
    mschapv2: EventDef,
}

fn identifier_of(event: &Event) -> Result<u8, ListenerError> {
    event
        .get_u64("identifier")
        .map(|id| id as u8)
        .ok_or(ListenerError::MissingField("identifier"))
}

impl PppChapAnalyzer {
    pub fn new(bus: &EventBus) -> Result<Arc<Self>, AnalyzerError> {
        let inputs = vec![
            require(bus, ID.name(), CHAP_CHALLENGE)?,
            require(bus, ID.name(), CHAP_RESPONSE)?,
            require(bus, ID.name(), CHAP_SUCCESS_FAILURE)?,
        ];

        let common = [
            FieldSpec::new("src", FieldType::Mac, "Peer station"),
            FieldSpec::new("dst", FieldType::Mac, "Authenticator station"),
            FieldSpec::new("identifier", FieldType::U8, "Exchange identifier"),
            FieldSpec::new("username", FieldType::String, "Peer name"),
            FieldSpec::new("success", FieldType::Bool, "Authentication succeeded"),
        ];

        let mut fields = common.to_vec();
        fields.push(FieldSpec::new("challenge", FieldType::Bytes, "Challenge value"));
        fields.push(FieldSpec::new("response", FieldType::Bytes, "Response value"));
        let challenge_response = bus.register_definition(CHAP_CHALLENGE_RESPONSE, 1, fields)?;

        let mut fields = common.to_vec();
        fields.push(FieldSpec::new("auth_challenge", FieldType::Bytes, "Authenticator challenge"));
        fields.push(FieldSpec::new("response", FieldType::Bytes, "NT response"));
        fields.push(FieldSpec::new("peer_challenge", FieldType::Bytes, "Peer challenge"));
        let mschapv2 = bus.register_definition(CHAP_MSCHAPV2, 1, fields)?;

        let outputs = vec![challenge_response.clone(), mschapv2.clone()];
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            upstream: Upstream::new(ID, inputs, outputs),
            challenge_response,
            mschapv2,
        }))
    }

    /// Feed one CHAP event into the session's exchange. Returns the
    /// exchange once all three parts were seen.
    fn update(
        &self,
        event: &Event,
        cx: &mut EventContext<'_>,
    ) -> Result<Option<ChapExchange>, ListenerError> {
        let identifier = identifier_of(event)?;
        let stations = cx
            .stack()
            .and_then(|stack| stack.ethernet_addresses());
        let Some(session) = cx.conntrack_mut() else {
            trace!(event = event.name(), "chap packet outside of a tracked session");
            return Ok(None);
        };

        if event.name() == CHAP_CHALLENGE {
            let exchange = ChapExchange {
                seen: SEEN_CHALLENGE,
                identifier,
                challenge: event.get_bytes("value").cloned().unwrap_or_default(),
                ..Default::default()
            };
            session.attach(ID, exchange);
            return Ok(None);
        }

        let Some(exchange) = session.attachment_mut::<ChapExchange>(ID) else {
            trace!(event = event.name(), identifier, "no chap challenge seen");
            return Ok(None);
        };
        if exchange.identifier != identifier {
            trace!(
                expected = exchange.identifier,
                identifier,
                "chap identifier mismatch, ignoring"
            );
            return Ok(None);
        }

        if event.name() == CHAP_RESPONSE {
            exchange.response = event.get_bytes("value").cloned().unwrap_or_default();
            exchange.username = event.get_str("name").unwrap_or_default().to_string();
            exchange.stations = stations;
            exchange.seen |= SEEN_RESPONSE;
        } else {
            exchange.success = event
                .get_bool("success")
                .ok_or(ListenerError::MissingField("success"))?;
            exchange.seen |= SEEN_RESULT;
        }

        if exchange.seen == SEEN_ALL {
            Ok(session.take_attachment::<ChapExchange>(ID))
        } else {
            Ok(None)
        }
    }

    fn finalize(&self, exchange: ChapExchange, source: &Event) -> Result<Option<Event>, ListenerError> {
        let mschapv2 = exchange.response.len() == MSCHAPV2_RESPONSE_LEN;
        let definition = if mschapv2 {
            &self.mschapv2
        } else {
            &self.challenge_response
        };
        if !definition.has_subscribers() {
            return Ok(None);
        }

        let mut event = Event::new(definition, source.timestamp())
            .with("identifier", exchange.identifier)?
            .with("username", exchange.username)?
            .with("success", exchange.success)?;
        if let Some((src, dst)) = exchange.stations {
            event.set("src", src)?;
            event.set("dst", dst)?;
        }

        if mschapv2 {
            event.set("auth_challenge", exchange.challenge)?;
            event.set("peer_challenge", exchange.response.slice(0..16))?;
            event.set("response", exchange.response.slice(24..48))?;
        } else {
            event.set("challenge", exchange.challenge)?;
            event.set("response", exchange.response)?;
        }
        Ok(Some(event))
    }
}

impl EventListener for PppChapAnalyzer {
    fn name(&self) -> &str {
        ID.name()
    }

    fn on_event(&self, event: &Event, cx: &mut EventContext<'_>) -> Result<(), ListenerError> {
        let Some(exchange) = self.update(event, cx)? else {
            return Ok(());
        };
        debug!(
            identifier = exchange.identifier,
            username = %exchange.username,
            success = exchange.success,
            "chap exchange complete"
        );
        if let Some(output) = self.finalize(exchange, event)? {
            cx.emit(output)
                .map_err(|e| ListenerError::Failed(e.to_string()))?;
        }
        Ok(())
    }
}

impl ListenerWatch for PppChapAnalyzer {
    fn listeners_changed(&self, bus: &EventBus, definition: &EventDef, has_listeners: bool) {
        if let Some(me) = self.me.upgrade() {
            self.upstream.output_changed(bus, me, definition, has_listeners);
        }
    }
}

impl Analyzer for PppChapAnalyzer {
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
    use crate::dispatch::{Dispatcher, Outcome};
    use crate::packet::{InputId, LinkType, Packet, Timestamp};
    use crate::proto::{Expectations, Protocol, ProtocolRegistry};
    use crate::registry::Counters;
    use crate::testutil::{self, CLIENT_MAC, SERVER_MAC};
    use parking_lot::Mutex;

    const SESSION: u16 = 0x0042;

    struct Fixture {
        bus: Arc<EventBus>,
        dispatcher: Dispatcher,
        analyzer: Arc<PppChapAnalyzer>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(
            ProtocolRegistry::with_defaults(&bus, Arc::new(Expectations::new()), 64).unwrap(),
        );
        let counters = Arc::new(Counters::new().unwrap());
        let dispatcher = Dispatcher::new(registry, bus.clone(), counters, 16);
        let analyzer = PppChapAnalyzer::new(&bus).unwrap();
        analyzer.start(&bus).unwrap();
        Fixture {
            bus,
            dispatcher,
            analyzer,
        }
    }

    struct Collector(Mutex<Vec<Event>>);

    impl EventListener for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn on_event(&self, event: &Event, _: &mut EventContext<'_>) -> Result<(), ListenerError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    fn collect(bus: &EventBus, name: &str) -> Arc<Collector> {
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        bus.subscribe(&bus.definition(name).unwrap(), collector.clone());
        collector
    }

    fn send(fx: &Fixture, from_peer: bool, chap: Vec<u8>, millis: u64) -> Outcome {
        let (src, dst) = if from_peer {
            (CLIENT_MAC, SERVER_MAC)
        } else {
            (SERVER_MAC, CLIENT_MAC)
        };
        let frame = testutil::pppoe_chap(src, dst, SESSION, &chap);
        let packet = Packet::new(frame, Timestamp::from_millis(millis), InputId(0), LinkType::Ethernet);
        fx.dispatcher.process(&packet).outcome
    }

    #[test]
    fn test_md5_exchange_correlated_across_packets() {
        let fx = fixture();
        let out = collect(&fx.bus, CHAP_CHALLENGE_RESPONSE);
        let challenge = [0x11u8; 16];
        let response = [0x22u8; 16];

        assert_eq!(send(&fx, false, testutil::chap_value(1, 7, &challenge, "bras"), 1_000), Outcome::Completed);
        send(&fx, true, testutil::chap_value(2, 7, &response, "alice"), 1_200);
        assert!(out.0.lock().is_empty());
        send(&fx, false, testutil::chap_result(3, 7, "Welcome"), 1_250);

        let events = out.0.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.get_u64("identifier"), Some(7));
        assert_eq!(event.get_str("username"), Some("alice"));
        assert_eq!(event.get_bool("success"), Some(true));
        assert_eq!(event.get_bytes("challenge").map(|b| b.to_vec()), Some(challenge.to_vec()));
        assert_eq!(event.get_bytes("response").map(|b| b.to_vec()), Some(response.to_vec()));
        assert_eq!(event.get_mac("src"), Some(CLIENT_MAC));
        assert_eq!(event.get_mac("dst"), Some(SERVER_MAC));
        assert_eq!(event.timestamp(), Timestamp::from_millis(1_250));

        let table = fx.dispatcher.registry().conntracks(Protocol::Pppoe).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mschapv2_response_split() {
        let fx = fixture();
        let out = collect(&fx.bus, CHAP_MSCHAPV2);
        let md5 = collect(&fx.bus, CHAP_CHALLENGE_RESPONSE);

        let mut response = vec![0xaau8; 16];
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&[0xbbu8; 24]);
        response.push(0);

        send(&fx, false, testutil::chap_value(1, 3, &[0x01; 16], "bras"), 10);
        send(&fx, true, testutil::chap_value(2, 3, &response, "bob"), 20);
        send(&fx, false, testutil::chap_result(4, 3, "E=691"), 30);

        assert!(md5.0.lock().is_empty());
        let events = out.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_bool("success"), Some(false));
        assert_eq!(events[0].get_bytes("peer_challenge").map(|b| b.to_vec()), Some(vec![0xaa; 16]));
        assert_eq!(events[0].get_bytes("response").map(|b| b.to_vec()), Some(vec![0xbb; 24]));
        assert_eq!(events[0].get_bytes("auth_challenge").map(|b| b.len()), Some(16));
    }

    #[test]
    fn test_mismatched_response_ignored_and_new_challenge_resets() {
        let fx = fixture();
        let out = collect(&fx.bus, CHAP_CHALLENGE_RESPONSE);

        send(&fx, false, testutil::chap_value(1, 1, &[1; 16], "bras"), 10);
        send(&fx, true, testutil::chap_value(2, 9, &[2; 16], "mallory"), 20);
        send(&fx, false, testutil::chap_value(1, 2, &[3; 16], "bras"), 30);
        send(&fx, true, testutil::chap_value(2, 2, &[4; 16], "carol"), 40);
        send(&fx, false, testutil::chap_result(3, 2, ""), 50);

        let events = out.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_str("username"), Some("carol"));
        assert_eq!(events[0].get_bytes("challenge").map(|b| b[0]), Some(3));
    }

    #[test]
    fn test_session_close_abandons_exchange() {
        let fx = fixture();
        let out = collect(&fx.bus, CHAP_CHALLENGE_RESPONSE);

        send(&fx, false, testutil::chap_value(1, 5, &[1; 16], "bras"), 10);
        let padt = testutil::pppoe_padt(SERVER_MAC, CLIENT_MAC, SESSION);
        fx.dispatcher
            .process(&Packet::new(padt, Timestamp::from_millis(20), InputId(0), LinkType::Ethernet));
        assert_eq!(fx.dispatcher.registry().conntracks(Protocol::Pppoe).unwrap().len(), 0);

        send(&fx, true, testutil::chap_value(2, 5, &[2; 16], "dave"), 30);
        send(&fx, false, testutil::chap_result(3, 5, ""), 40);
        assert!(out.0.lock().is_empty());
    }

    #[test]
    fn test_no_output_listener_means_no_upstream_subscription() {
        let fx = fixture();
        let challenge = fx.bus.definition(CHAP_CHALLENGE).unwrap();
        assert!(!challenge.has_subscribers());

        send(&fx, false, testutil::chap_value(1, 5, &[1; 16], "bras"), 10);
        let table = fx.dispatcher.registry().conntracks(Protocol::Pppoe).unwrap();
        let entry = table.lookup(&table_key()).unwrap();
        assert!(!entry.lock().has_attachment(ID));

        let out = collect(&fx.bus, CHAP_MSCHAPV2);
        assert!(challenge.has_subscribers());
        drop(out);
        fx.analyzer.stop(&fx.bus);
        assert!(!challenge.has_subscribers());
    }

    fn table_key() -> crate::conntrack::ConntrackKey {
        crate::conntrack::ConntrackKey::session(SESSION, CLIENT_MAC, SERVER_MAC)
    }
}
