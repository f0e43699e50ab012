//! Runtime parameters and performance counters.
//!
//! Parameters are named, typed values that the management surface reads
//! and changes. Changing one runs its checks, and for some parameters it
//! briefly pauses packet processing.

mod perf;

pub use perf::{CounterSnapshot, Counters, TimeAccumulator};

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use parking_lot::RwLock;
use tracing::info;

use crate::engine::PauseGate;
use crate::error::RegistryError;

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Text(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::U32(_) => "u32",
            ParamValue::U64(_) => "u64",
            ParamValue::Text(_) => "text",
        }
    }

    /// Parse `raw` as a value of the same type as `self`.
    pub fn parse_like(&self, raw: &str) -> Result<ParamValue, String> {
        let raw = raw.trim();
        match self {
            ParamValue::Bool(_) => match raw.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err("expected a boolean".to_string()),
            },
            ParamValue::U32(_) => raw
                .parse()
                .map(ParamValue::U32)
                .map_err(|e| format!("expected u32: {}", e)),
            ParamValue::U64(_) => raw
                .parse()
                .map(ParamValue::U64)
                .map_err(|e| format!("expected u64: {}", e)),
            ParamValue::Text(_) => Ok(ParamValue::Text(raw.to_string())),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::U32(v) => Some(u64::from(*v)),
            ParamValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::U32(v) => write!(f, "{}", v),
            ParamValue::U64(v) => write!(f, "{}", v),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// Behaviour flags of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamFlags(u8);

impl ParamFlags {
    pub const NONE: ParamFlags = ParamFlags(0);
    /// Never changes after registration.
    pub const IMMUTABLE: ParamFlags = ParamFlags(0x1);
    /// May change while packets are being processed.
    pub const NOT_LOCKED_WHILE_RUNNING: ParamFlags = ParamFlags(0x2);
    /// Processing is paused while the value changes.
    pub const PAUSE_PROCESSING: ParamFlags = ParamFlags(0x4);

    pub fn contains(self, other: ParamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ParamFlags {
    type Output = ParamFlags;

    fn bitor(self, rhs: ParamFlags) -> ParamFlags {
        ParamFlags(self.0 | rhs.0)
    }
}

/// Validates the raw text before it is parsed.
pub type PreCheck = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Runs after the value is applied; an error reverts it. It must not call
/// back into the registry.
pub type PostCheck = Box<dyn Fn(&ParamValue) -> Result<(), String> + Send + Sync>;

pub struct Param {
    name: String,
    description: String,
    default: ParamValue,
    value: ParamValue,
    flags: ParamFlags,
    pre_check: Option<PreCheck>,
    post_check: Option<PostCheck>,
}

impl Param {
    pub fn new(name: &str, description: &str, default: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: default.clone(),
            default,
            flags: ParamFlags::NONE,
            pre_check: None,
            post_check: None,
        }
    }

    pub fn with_flags(mut self, flags: ParamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Start from `value` instead of the default.
    pub fn with_value(mut self, value: ParamValue) -> Self {
        self.value = value;
        self
    }

    pub fn with_pre_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.pre_check = Some(Box::new(check));
        self
    }

    pub fn with_post_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&ParamValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.post_check = Some(Box::new(check));
        self
    }

    fn invalid(&self, value: &str, reason: String) -> RegistryError {
        RegistryError::InvalidValue {
            name: self.name.clone(),
            value: value.to_string(),
            reason,
        }
    }

    /// Apply `value`, reverting if the post-check refuses it.
    fn apply(&mut self, value: ParamValue) -> Result<(), RegistryError> {
        let previous = std::mem::replace(&mut self.value, value);
        if let Some(check) = &self.post_check {
            if let Err(reason) = check(&self.value) {
                let rejected = std::mem::replace(&mut self.value, previous);
                return Err(self.invalid(&rejected.to_string(), reason));
            }
        }
        Ok(())
    }
}

/// Public view of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    pub description: String,
    pub value: ParamValue,
    pub default: ParamValue,
    pub flags: ParamFlags,
}

#[derive(Default)]
pub struct ParamRegistry {
    params: RwLock<BTreeMap<String, Param>>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, param: Param) -> Result<(), RegistryError> {
        let mut params = self.params.write();
        if params.contains_key(&param.name) {
            return Err(RegistryError::Duplicate(param.name));
        }
        params.insert(param.name.clone(), param);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ParamValue, RegistryError> {
        self.params
            .read()
            .get(name)
            .map(|param| param.value.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All parameters, sorted by name.
    pub fn list(&self) -> Vec<ParamInfo> {
        self.params
            .read()
            .values()
            .map(|param| ParamInfo {
                name: param.name.clone(),
                description: param.description.clone(),
                value: param.value.clone(),
                default: param.default.clone(),
                flags: param.flags,
            })
            .collect()
    }

    /// Restore the default value.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let mut params = self.params.write();
        let param = params
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let default = param.default.clone();
        param.apply(default)
    }

    /// Change a parameter from its text form.
    ///
    /// Immutable parameters are refused, the pre-check sees the raw text,
    /// and the text is parsed with the type of the current value. While
    /// processing runs, only parameters flagged for it may change; those
    /// flagged `PAUSE_PROCESSING` change with processing paused.
    pub async fn set(
        &self,
        name: &str,
        raw: &str,
        gate: &PauseGate,
    ) -> Result<ParamValue, RegistryError> {
        let (value, pause) = {
            let params = self.params.read();
            let param = params
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if param.flags.contains(ParamFlags::IMMUTABLE) {
                return Err(RegistryError::Immutable(name.to_string()));
            }
            if let Some(check) = &param.pre_check {
                check(raw).map_err(|reason| param.invalid(raw, reason))?;
            }
            let value = param
                .value
                .parse_like(raw)
                .map_err(|reason| param.invalid(raw, reason))?;

            let mut pause = false;
            if gate.is_running() {
                if param.flags.contains(ParamFlags::PAUSE_PROCESSING) {
                    pause = true;
                } else if !param.flags.contains(ParamFlags::NOT_LOCKED_WHILE_RUNNING) {
                    return Err(RegistryError::Locked(name.to_string()));
                }
            }
            (value, pause)
        };

        let paused_here = pause && gate.pause().await;
        let result = self.apply(name, value.clone());
        if paused_here {
            gate.resume().await;
        }
        result?;

        info!(param = name, %value, "parameter changed");
        Ok(value)
    }

    fn apply(&self, name: &str, value: ParamValue) -> Result<(), RegistryError> {
        let mut params = self.params.write();
        let param = params
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        param.apply(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn registry() -> ParamRegistry {
        let registry = ParamRegistry::new();
        registry
            .add(
                Param::new("timeout", "Idle timeout", ParamValue::U64(120))
                    .with_flags(ParamFlags::NOT_LOCKED_WHILE_RUNNING),
            )
            .unwrap();
        registry
            .add(Param::new("workers", "Worker count", ParamValue::U32(4)).with_flags(ParamFlags::IMMUTABLE))
            .unwrap();
        registry
            .add(Param::new("label", "Free text", ParamValue::Text("x".into())))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_set_parses_with_current_type() {
        let registry = registry();
        let gate = PauseGate::new();

        assert_eq!(registry.set("timeout", "30", &gate).await, Ok(ParamValue::U64(30)));
        assert_eq!(registry.get("timeout"), Ok(ParamValue::U64(30)));
        assert!(matches!(
            registry.set("timeout", "soon", &gate).await,
            Err(RegistryError::InvalidValue { .. })
        ));
        assert_eq!(registry.get("timeout"), Ok(ParamValue::U64(30)));
    }

    #[tokio::test]
    async fn test_immutable_and_unknown() {
        let registry = registry();
        let gate = PauseGate::new();
        assert_eq!(
            registry.set("workers", "8", &gate).await,
            Err(RegistryError::Immutable("workers".to_string()))
        );
        assert_eq!(
            registry.set("nope", "1", &gate).await,
            Err(RegistryError::NotFound("nope".to_string()))
        );
        assert_eq!(
            registry.add(Param::new("label", "", ParamValue::Bool(true))),
            Err(RegistryError::Duplicate("label".to_string()))
        );
    }

    #[tokio::test]
    async fn test_locked_while_running() {
        let registry = registry();
        let gate = PauseGate::new();
        gate.set_running(true);

        assert_eq!(
            registry.set("label", "y", &gate).await,
            Err(RegistryError::Locked("label".to_string()))
        );
        assert!(registry.set("timeout", "60", &gate).await.is_ok());
    }

    #[tokio::test]
    async fn test_pre_and_post_checks() {
        let applied = Arc::new(AtomicU64::new(16));
        let registry = ParamRegistry::new();
        let sink = applied.clone();
        registry
            .add(
                Param::new("depth", "Stack depth", ParamValue::U32(16))
                    .with_flags(ParamFlags::PAUSE_PROCESSING)
                    .with_pre_check(|raw| {
                        if raw.starts_with('-') {
                            Err("negative".to_string())
                        } else {
                            Ok(())
                        }
                    })
                    .with_post_check(move |value| match value.as_u64() {
                        Some(0) | None => Err("must be at least 1".to_string()),
                        Some(v) => {
                            sink.store(v, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            )
            .unwrap();

        let gate = PauseGate::new();
        gate.set_running(true);

        assert!(matches!(
            registry.set("depth", "-1", &gate).await,
            Err(RegistryError::InvalidValue { .. })
        ));
        assert!(matches!(
            registry.set("depth", "0", &gate).await,
            Err(RegistryError::InvalidValue { .. })
        ));
        assert_eq!(registry.get("depth"), Ok(ParamValue::U32(16)));

        assert_eq!(registry.set("depth", "8", &gate).await, Ok(ParamValue::U32(8)));
        assert_eq!(applied.load(Ordering::SeqCst), 8);
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_pause_processing_keeps_operator_pause() {
        let registry = ParamRegistry::new();
        registry
            .add(Param::new("depth", "", ParamValue::U32(4)).with_flags(ParamFlags::PAUSE_PROCESSING))
            .unwrap();
        let gate = PauseGate::new();
        gate.set_running(true);
        gate.pause().await;

        registry.set("depth", "5", &gate).await.unwrap();
        assert!(gate.is_paused());
    }

    #[test]
    fn test_reset_and_list() {
        let registry = registry();
        registry.apply("label", ParamValue::Text("changed".into())).unwrap();
        registry.reset("label").unwrap();
        assert_eq!(registry.get("label"), Ok(ParamValue::Text("x".into())));

        let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["label", "timeout", "workers"]);
    }

    #[test]
    fn test_bool_parsing_and_flags() {
        let current = ParamValue::Bool(false);
        assert_eq!(current.parse_like("On"), Ok(ParamValue::Bool(true)));
        assert!(current.parse_like("maybe").is_err());

        let flags = ParamFlags::IMMUTABLE | ParamFlags::PAUSE_PROCESSING;
        assert!(flags.contains(ParamFlags::PAUSE_PROCESSING));
        assert!(!flags.contains(ParamFlags::NOT_LOCKED_WHILE_RUNNING));
    }
}
