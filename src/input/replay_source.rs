//! In-memory replay source.

use std::collections::VecDeque;

use super::{PacketSource, RawFrame};
use crate::error::SourceError;

/// Replays a fixed queue of frames, then reports end of stream.
///
/// Useful for embedding the engine behind another capture mechanism and
/// for driving the pipeline deterministically in tests.
#[derive(Debug, Default)]
pub struct ReplaySource {
    name: String,
    frames: VecDeque<RawFrame>,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self {
            name: name.into(),
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: RawFrame) {
        self.frames.push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl PacketSource for ReplaySource {
    fn read(&mut self) -> Result<Option<RawFrame>, SourceError> {
        Ok(self.frames.pop_front())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
