//! The engine ties the pipeline together: input, workers, dispatcher,
//! analyzers, payload store and runtime parameters.

mod gate;

pub use gate::PauseGate;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, PppChapAnalyzer, TftpFileAnalyzer};
use crate::config::EngineConfig;
use crate::content::ContentDecoders;
use crate::dispatch::{Dispatcher, Outcome, ProcessReport};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::input::{Acquired, InputChannel, InputStats};
use crate::packet::{LinkType, Packet, Timestamp};
use crate::payload::{MemoryPayloadStore, PayloadStore};
use crate::proto::{Expectations, Protocol, ProtocolRegistry};
use crate::registry::{
    CounterSnapshot, Counters, Param, ParamFlags, ParamInfo, ParamRegistry, ParamValue,
};

pub const PARAM_CONNTRACK_TIMEOUT: &str = "conntrack_timeout";
pub const PARAM_MAX_STACK_DEPTH: &str = "max_stack_depth";
pub const PARAM_QUEUE_DEPTH: &str = "queue_depth";
pub const PARAM_WORKERS: &str = "workers";

pub struct EngineBuilder {
    config: EngineConfig,
    payloads: Option<Arc<dyn PayloadStore>>,
    analyzers: bool,
}

impl EngineBuilder {
    pub fn with_payload_store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(store);
        self
    }

    pub fn without_analyzers(mut self) -> Self {
        self.analyzers = false;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let bus = Arc::new(EventBus::new());
        let expectations = Arc::new(Expectations::new());
        let counters = Arc::new(Counters::new()?);
        let registry = Arc::new(ProtocolRegistry::with_defaults(
            &bus,
            expectations.clone(),
            config.max_conntracks,
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            bus.clone(),
            counters.clone(),
            config.max_stack_depth,
        ));
        let payloads = self
            .payloads
            .unwrap_or_else(|| Arc::new(MemoryPayloadStore::new(config.payload_max_bytes)));
        let decoders = ContentDecoders::default();

        let mut analyzers: Vec<Arc<dyn Analyzer>> = Vec::new();
        if self.analyzers {
            analyzers.push(PppChapAnalyzer::new(&bus)?);
            analyzers.push(TftpFileAnalyzer::new(
                &bus,
                payloads.clone(),
                decoders.clone(),
                counters.clone(),
            )?);
            for analyzer in &analyzers {
                analyzer.start(&bus)?;
                debug!(analyzer = %analyzer.id(), "analyzer started");
            }
        }

        let conntrack_timeout = Arc::new(AtomicU64::new(config.conntrack_timeout.as_secs()));
        let params = engine_params(&config, &dispatcher, &conntrack_timeout)?;

        Ok(Engine {
            config,
            bus,
            expectations,
            counters,
            dispatcher,
            payloads,
            decoders,
            analyzers,
            params,
            gate: Arc::new(PauseGate::new()),
            conntrack_timeout,
            shut_down: AtomicBool::new(false),
        })
    }
}

fn engine_params(
    config: &EngineConfig,
    dispatcher: &Arc<Dispatcher>,
    conntrack_timeout: &Arc<AtomicU64>,
) -> Result<ParamRegistry, EngineError> {
    let params = ParamRegistry::new();

    let timeout = conntrack_timeout.clone();
    params.add(
        Param::new(
            PARAM_CONNTRACK_TIMEOUT,
            "Seconds of inactivity before a conntrack expires",
            ParamValue::U64(config.conntrack_timeout.as_secs()),
        )
        .with_flags(ParamFlags::NOT_LOCKED_WHILE_RUNNING)
        .with_post_check(move |value| {
            let secs = value.as_u64().ok_or("expected seconds")?;
            timeout.store(secs, Ordering::SeqCst);
            Ok(())
        }),
    )?;

    let depth_dispatcher = dispatcher.clone();
    params.add(
        Param::new(
            PARAM_MAX_STACK_DEPTH,
            "Maximum number of protocol layers per packet",
            ParamValue::U32(u32::try_from(config.max_stack_depth).unwrap_or(u32::MAX)),
        )
        .with_flags(ParamFlags::PAUSE_PROCESSING)
        .with_post_check(move |value| match value.as_u64() {
            Some(depth) if depth >= 1 => {
                depth_dispatcher.set_max_depth(depth as usize);
                Ok(())
            }
            _ => Err("must be at least 1".to_string()),
        }),
    )?;

    params.add(
        Param::new(
            PARAM_QUEUE_DEPTH,
            "Input queue capacity",
            ParamValue::U64(config.queue_depth as u64),
        )
        .with_flags(ParamFlags::IMMUTABLE),
    )?;
    params.add(
        Param::new(
            PARAM_WORKERS,
            "Dispatcher workers",
            ParamValue::U64(config.effective_workers() as u64),
        )
        .with_flags(ParamFlags::IMMUTABLE),
    )?;

    Ok(params)
}

/// Per-run totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub packets: u64,
    pub completed: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub depth_exceeded: u64,
    pub events: u64,
    pub listener_failures: u64,
    pub input: InputStats,
}

impl RunSummary {
    fn record(&mut self, report: &ProcessReport) {
        self.packets += 1;
        self.events += report.events as u64;
        self.listener_failures += report.listener_failures as u64;
        match report.outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Malformed { .. } => self.malformed += 1,
            Outcome::Ignored { .. } => self.ignored += 1,
            Outcome::Dropped { .. } => self.dropped += 1,
            Outcome::DepthExceeded => self.depth_exceeded += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.packets += other.packets;
        self.completed += other.completed;
        self.malformed += other.malformed;
        self.ignored += other.ignored;
        self.dropped += other.dropped;
        self.depth_exceeded += other.depth_exceeded;
        self.events += other.events;
        self.listener_failures += other.listener_failures;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets ({} completed, {} malformed, {} ignored, {} dropped, {} too deep), {} events, {} listener failures",
            self.packets,
            self.completed,
            self.malformed,
            self.ignored,
            self.dropped,
            self.depth_exceeded,
            self.events,
            self.listener_failures
        )
    }
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub conntracks: Vec<(Protocol, usize)>,
    /// Event definitions with their subscriber counts.
    pub events: Vec<(String, usize)>,
    pub payloads: usize,
    pub payload_bytes: u64,
    pub counters: CounterSnapshot,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (self.running, self.paused) {
            (_, true) => "paused",
            (true, false) => "running",
            (false, false) => "idle",
        };
        writeln!(f, "state: {}", state)?;
        writeln!(f, "counters: {}", self.counters)?;
        let conntracks: Vec<String> = self
            .conntracks
            .iter()
            .map(|(protocol, count)| format!("{}={}", protocol, count))
            .collect();
        writeln!(f, "conntracks: {}", conntracks.join(" "))?;
        writeln!(
            f,
            "payloads: {} ({} bytes)",
            self.payloads, self.payload_bytes
        )?;
        write!(f, "events:")?;
        for (name, subscribers) in &self.events {
            write!(f, "\n  {} ({} listeners)", name, subscribers)?;
        }
        Ok(())
    }
}

/// A worker-routing hint that is equal for both directions of a flow.
fn flow_hint(packet: &Packet) -> u64 {
    const ETHERNET_HEADER: usize = 14;
    let data = packet.data();
    let mut hasher = DefaultHasher::new();

    let ipv4_pair = |offset: usize| -> Option<(u32, u32)> {
        let header = data.get(offset..offset + 20)?;
        let src = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let dst = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
        Some((src.min(dst), src.max(dst)))
    };

    match packet.link() {
        LinkType::Ipv4 => ipv4_pair(0).hash(&mut hasher),
        LinkType::Ppp => {}
        LinkType::Ethernet => {
            let ethertype = data.get(12..14).map(|t| u16::from_be_bytes([t[0], t[1]]));
            match ethertype {
                Some(0x0800) => ipv4_pair(ETHERNET_HEADER).hash(&mut hasher),
                Some(0x8863) | Some(0x8864) => {
                    if let (Some(dst), Some(src), Some(session)) = (
                        data.get(0..6),
                        data.get(6..12),
                        data.get(ETHERNET_HEADER + 2..ETHERNET_HEADER + 4),
                    ) {
                        session.hash(&mut hasher);
                        src.min(dst).hash(&mut hasher);
                        src.max(dst).hash(&mut hasher);
                    }
                }
                _ => {}
            }
        }
    }
    hasher.finish()
}

/// Expire idle entries of every table.
fn expire_tables(dispatcher: &Dispatcher, counters: &Counters, threshold: Timestamp) -> usize {
    let expired: usize = dispatcher
        .registry()
        .tables()
        .into_iter()
        .map(|table| table.expire_idle(threshold))
        .sum();
    counters.conntracks_expired.inc_by(expired as u64);
    if expired > 0 {
        info!(expired, %threshold, "expired idle conntracks");
    }
    expired
}

pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    expectations: Arc<Expectations>,
    counters: Arc<Counters>,
    dispatcher: Arc<Dispatcher>,
    payloads: Arc<dyn PayloadStore>,
    decoders: ContentDecoders,
    analyzers: Vec<Arc<dyn Analyzer>>,
    params: ParamRegistry,
    gate: Arc<PauseGate>,
    /// Seconds; follows the `conntrack_timeout` parameter.
    conntrack_timeout: Arc<AtomicU64>,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            payloads: None,
            analyzers: true,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn expectations(&self) -> &Arc<Expectations> {
        &self.expectations
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn payloads(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    pub fn content_decoders(&self) -> &ContentDecoders {
        &self.decoders
    }

    pub fn params(&self) -> Vec<ParamInfo> {
        self.params.list()
    }

    pub fn conntrack_timeout(&self) -> Duration {
        Duration::from_secs(self.conntrack_timeout.load(Ordering::SeqCst))
    }

    /// Process packets from `input` until it shuts down.
    ///
    /// Packets are spread over the workers by flow, so both directions of a
    /// flow reach the same worker in arrival order. Queued packets are
    /// processed before this returns.
    pub async fn run(&self, mut input: InputChannel) -> Result<RunSummary, EngineError> {
        if self.gate.set_running(true) {
            return Err(EngineError::AlreadyRunning);
        }

        let workers = self.config.effective_workers().max(1);
        info!(input = input.name(), workers, "engine started");

        let mut senders = Vec::with_capacity(workers);
        let mut handles: Vec<JoinHandle<RunSummary>> = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.worker_queue_depth.max(1));
            senders.push(tx);
            let dispatcher = self.dispatcher.clone();
            let gate = self.gate.clone();
            let counters = self.counters.clone();
            // Dispatch blocks on entry locks and runs listeners inline, so
            // it stays off the async threads.
            handles.push(tokio::task::spawn_blocking(move || {
                worker_loop(worker, rx, &dispatcher, &gate, &counters)
            }));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let expiry = tokio::spawn(expiry_loop(
            self.config.expiry_interval,
            stop_rx,
            self.dispatcher.clone(),
            self.counters.clone(),
            self.conntrack_timeout.clone(),
        ));

        while let Acquired::Packet(packet) = input.acquire().await {
            let worker = (flow_hint(&packet) % workers as u64) as usize;
            self.counters.queued.inc();
            // Waits while the worker's queue is full.
            if senders[worker].send(packet).await.is_err() {
                self.counters.queued.dec();
                warn!(worker, "worker stopped, ending run");
                break;
            }
        }
        drop(senders);

        let mut summary = RunSummary::default();
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(tally) => summary.merge(tally),
                Err(e) => failure = Some(EngineError::Worker(e.to_string())),
            }
        }

        let _ = stop_tx.send(true);
        if let Err(e) = expiry.await {
            warn!(error = %e, "expiry task failed");
        }
        self.gate.set_running(false);

        summary.input = input.stats();
        info!(%summary, "engine stopped");
        match failure {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }

    /// Stop processing until [`Engine::resume`]. Waits for in-flight
    /// packets.
    pub async fn pause(&self) -> bool {
        self.gate.pause().await
    }

    pub async fn resume(&self) -> bool {
        self.gate.resume().await
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub async fn set_param(&self, name: &str, value: &str) -> Result<ParamValue, EngineError> {
        Ok(self.params.set(name, value, &self.gate).await?)
    }

    pub fn param(&self, name: &str) -> Result<ParamValue, EngineError> {
        Ok(self.params.get(name)?)
    }

    /// Close every conntrack idle since before `now - conntrack_timeout`.
    pub fn expire_idle(&self, now: Timestamp) -> usize {
        let threshold = now - self.conntrack_timeout();
        expire_tables(&self.dispatcher, &self.counters, threshold)
    }

    /// Process one packet directly, outside of [`Engine::run`].
    pub fn process(&self, packet: &Packet) -> ProcessReport {
        self.dispatcher.process(packet)
    }

    pub fn status(&self) -> EngineStatus {
        let registry = self.dispatcher.registry();
        EngineStatus {
            running: self.gate.is_running(),
            paused: self.gate.is_paused(),
            conntracks: registry
                .protocols()
                .into_iter()
                .filter_map(|protocol| {
                    registry
                        .conntracks(protocol)
                        .map(|table| (protocol, table.len()))
                })
                .collect(),
            events: self
                .bus
                .definitions()
                .iter()
                .map(|def| (def.name().to_string(), def.subscriber_count()))
                .collect(),
            payloads: self.payloads.len(),
            payload_bytes: self.payloads.stored_bytes(),
            counters: self.counters.snapshot(),
        }
    }

    /// Stop the analyzers and close every conntrack. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for analyzer in &self.analyzers {
            analyzer.stop(&self.bus);
            debug!(analyzer = %analyzer.id(), "analyzer stopped");
        }
        let closed: usize = self
            .dispatcher
            .registry()
            .tables()
            .into_iter()
            .map(|table| table.close_all())
            .sum();
        info!(closed, "engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker: usize,
    mut rx: mpsc::Receiver<Packet>,
    dispatcher: &Dispatcher,
    gate: &PauseGate,
    counters: &Counters,
) -> RunSummary {
    let mut tally = RunSummary::default();
    while let Some(packet) = rx.blocking_recv() {
        counters.queued.dec();
        let _permit = gate.enter_blocking();
        let report = dispatcher.process(&packet);
        tally.record(&report);
    }
    debug!(worker, packets = tally.packets, "worker finished");
    tally
}

async fn expiry_loop(
    period: Duration,
    mut stop: watch::Receiver<bool>,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<Counters>,
    timeout: Arc<AtomicU64>,
) {
    let period = period.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Idle time is measured in capture time, not wall time.
                if let Some(now) = dispatcher.clock().now() {
                    let timeout = Duration::from_secs(timeout.load(Ordering::SeqCst));
                    expire_tables(&dispatcher, &counters, now - timeout);
                }
            }
            _ = stop.changed() => break,
        }
    }
}
