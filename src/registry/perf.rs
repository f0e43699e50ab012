//! Performance counters.

use std::fmt;
use std::time::Duration;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Accumulated wall time, in microseconds.
#[derive(Clone)]
pub struct TimeAccumulator(IntCounter);

impl TimeAccumulator {
    pub fn add(&self, elapsed: Duration) {
        self.0
            .inc_by(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.get())
    }
}

/// Pipeline counters, registered in a private prometheus registry.
///
/// Components increment and read them; nothing resets them.
pub struct Counters {
    registry: Registry,
    pub packets: IntCounter,
    pub bytes: IntCounter,
    pub malformed: IntCounter,
    pub ignored: IntCounter,
    pub dropped: IntCounter,
    pub depth_exceeded: IntCounter,
    pub events: IntCounter,
    pub listener_failures: IntCounter,
    pub conntracks_expired: IntCounter,
    pub payloads_stored: IntCounter,
    pub queued: IntGauge,
    pub processing_time: TimeAccumulator,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Counters {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("netrecon".to_string()), None)?;
        let queued = IntGauge::new("queued_packets", "Packets waiting for a worker")?;
        registry.register(Box::new(queued.clone()))?;

        Ok(Self {
            packets: counter(&registry, "packets_total", "Packets processed")?,
            bytes: counter(&registry, "bytes_total", "Bytes processed")?,
            malformed: counter(&registry, "malformed_total", "Packets with a malformed layer")?,
            ignored: counter(&registry, "ignored_total", "Packets on invalid flows")?,
            dropped: counter(&registry, "dropped_total", "Packets dropped for lack of resources")?,
            depth_exceeded: counter(
                &registry,
                "depth_exceeded_total",
                "Packets exceeding the stack depth",
            )?,
            events: counter(&registry, "events_total", "Events emitted by decoders")?,
            listener_failures: counter(
                &registry,
                "listener_failures_total",
                "Failed listener callbacks",
            )?,
            conntracks_expired: counter(
                &registry,
                "conntracks_expired_total",
                "Conntracks closed by idle expiry",
            )?,
            payloads_stored: counter(&registry, "payloads_stored_total", "Payloads stored")?,
            processing_time: TimeAccumulator(counter(
                &registry,
                "processing_microseconds_total",
                "Time spent dispatching packets",
            )?),
            queued,
            registry,
        })
    }

    /// Counters in the prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets: self.packets.get(),
            bytes: self.bytes.get(),
            malformed: self.malformed.get(),
            ignored: self.ignored.get(),
            dropped: self.dropped.get(),
            depth_exceeded: self.depth_exceeded.get(),
            events: self.events.get(),
            listener_failures: self.listener_failures.get(),
            conntracks_expired: self.conntracks_expired.get(),
            payloads_stored: self.payloads_stored.get(),
            queued: self.queued.get(),
            processing_time: self.processing_time.get(),
        }
    }
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub depth_exceeded: u64,
    pub events: u64,
    pub listener_failures: u64,
    pub conntracks_expired: u64,
    pub payloads_stored: u64,
    pub queued: i64,
    pub processing_time: Duration,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={} bytes={} malformed={} ignored={} dropped={} depth_exceeded={} events={} listener_failures={} expired={} payloads={}",
            self.packets,
            self.bytes,
            self.malformed,
            self.ignored,
            self.dropped,
            self.depth_exceeded,
            self.events,
            self.listener_failures,
            self.conntracks_expired,
            self.payloads_stored
        )
    }
}
