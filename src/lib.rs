//! netrecon - network traffic reconstruction engine.
//!
//! Packets flow from an [`input::InputChannel`] through the
//! [`dispatch::Dispatcher`], which decodes each protocol layer, keeps
//! per-flow state in conntrack tables and emits typed events. Analyzers
//! correlate those events across packets into credentials and files.

pub mod analyzer;
pub mod config;
pub mod conntrack;
pub mod content;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod input;
pub mod packet;
pub mod payload;
pub mod proto;
pub mod registry;
pub mod reporter;

#[cfg(test)]
mod testutil;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStatus, RunSummary};
pub use error::EngineError;
