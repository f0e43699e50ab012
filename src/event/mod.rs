//! Event framework.
//!
//! Decoders and analyzers register typed event definitions once at startup.
//! An [`Event`] is one firing of a definition: it is filled field by field
//! and handed to [`EventBus::emit`], which closes it and delivers it to every
//! subscriber of the definition.

mod bus;

pub use bus::{EventBus, EventContext, EventListener, ListenerWatch, SubscriptionId};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use macaddr::MacAddr6;
use parking_lot::{Mutex, RwLock};

use crate::error::EventError;
use crate::packet::Timestamp;
use bus::Subscription;

/// Type of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    String,
    Bytes,
    Ip,
    Mac,
    Timestamp,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::U8 => "u8",
            FieldType::U16 => "u16",
            FieldType::U32 => "u32",
            FieldType::U64 => "u64",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Ip => "ip",
            FieldType::Mac => "mac",
            FieldType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
    Bytes(Bytes),
    Ip(IpAddr),
    Mac(MacAddr6),
    Timestamp(Timestamp),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::U8(_) => FieldType::U8,
            Value::U16(_) => FieldType::U16,
            Value::U32(_) => FieldType::U32,
            Value::U64(_) => FieldType::U64,
            Value::String(_) => FieldType::String,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Ip(_) => FieldType::Ip,
            Value::Mac(_) => FieldType::Mac,
            Value::Timestamp(_) => FieldType::Timestamp,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any unsigned integer value, widened.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Value::Ip(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_mac(&self) -> Option<MacAddr6> {
        match self {
            Value::Mac(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Bytes(v) => {
                for byte in v.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Ip(v) => write!(f, "{}", v),
            Value::Mac(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    String => String,
    Bytes => Bytes,
    IpAddr => Ip,
    MacAddr6 => Mac,
    Timestamp => Timestamp,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Ipv4Addr> for Value {
    fn from(v: Ipv4Addr) -> Self {
        Value::Ip(IpAddr::V4(v))
    }
}

/// Schema entry of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub description: &'static str,
}

impl FieldSpec {
    pub const fn new(name: &'static str, ty: FieldType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            description,
        }
    }
}

/// Handle to a registered definition.
pub type EventDef = Arc<EventDefinition>;

/// A registered event schema and its subscriber list.
pub struct EventDefinition {
    name: String,
    version: u32,
    fields: Vec<FieldSpec>,
    subscribers: RwLock<Arc<Vec<Subscription>>>,
    subscriber_count: AtomicUsize,
    watchers: Mutex<Vec<Arc<dyn ListenerWatch>>>,
    emitted: AtomicU64,
}

impl EventDefinition {
    fn new(name: &str, version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            version,
            fields,
            subscribers: RwLock::new(Arc::new(Vec::new())),
            subscriber_count: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
            emitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Whether anyone would receive an emitted event.
    ///
    /// Check this before doing expensive event construction work.
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }

    /// Number of events emitted for this definition so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("fields", &self.fields)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Lifecycle of an event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Created, no field set yet.
    Open,
    /// Some fields set.
    Filling,
    /// Emitted; read-only.
    Closed,
}

/// One occurrence of an event definition.
#[derive(Debug, Clone)]
pub struct Event {
    definition: EventDef,
    values: Vec<Option<Value>>,
    timestamp: Timestamp,
    state: EventState,
}

impl Event {
    pub fn new(definition: &EventDef, timestamp: Timestamp) -> Self {
        Self {
            definition: definition.clone(),
            values: vec![None; definition.fields.len()],
            timestamp,
            state: EventState::Open,
        }
    }

    pub fn definition(&self) -> &EventDef {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    /// Set a field, checking it against the definition.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), EventError> {
        if self.state == EventState::Closed {
            return Err(EventError::Closed(self.definition.name.clone()));
        }
        let index = self
            .definition
            .field_index(field)
            .ok_or_else(|| EventError::UnknownField {
                event: self.definition.name.clone(),
                field: field.to_string(),
            })?;

        let value = value.into();
        let expected = self.definition.fields[index].ty;
        if value.field_type() != expected {
            return Err(EventError::TypeMismatch {
                event: self.definition.name.clone(),
                field: field.to_string(),
                expected: expected.name(),
                actual: value.field_type().name(),
            });
        }

        self.values[index] = Some(value);
        self.state = EventState::Filling;
        Ok(())
    }

    /// Builder form of [`Event::set`].
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self, EventError> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        let index = self.definition.field_index(field)?;
        self.values[index].as_ref()
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field)?.as_str()
    }

    pub fn get_bytes(&self, field: &str) -> Option<&Bytes> {
        self.get(field)?.as_bytes()
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field)?.as_u64()
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field)?.as_bool()
    }

    pub fn get_ip(&self, field: &str) -> Option<IpAddr> {
        self.get(field)?.as_ip()
    }

    pub fn get_mac(&self, field: &str) -> Option<MacAddr6> {
        self.get(field)?.as_mac()
    }

    /// Fields in definition order, with their values if set.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldSpec, Option<&Value>)> {
        self.definition
            .fields
            .iter()
            .zip(self.values.iter().map(Option::as_ref))
    }

    pub(crate) fn close(&mut self) {
        self.state = EventState::Closed;
    }
}
