//! Provider adapter contract.
//!
//! One [`ProviderAdapter`] exists per provider.  It shapes requests, parses
//! complete responses, and turns raw stream frames into [`FrameEvent`]s.  The
//! engine never looks at provider JSON itself; correlation ids, role names and
//! block layouts are translated here and nowhere else.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;
use crate::policy::FunctionCallingPolicy;
use crate::types::{FrameEvent, FunctionDefinition, Message, ProviderReply};

/// A request ready to hand to a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Provider-shaped JSON body.
    pub body: Value,

    /// Whether the provider should stream its answer.
    pub stream: bool,
}

impl ProviderRequest {
    /// A non-streamed request.
    pub fn new(body: Value) -> Self {
        Self {
            body,
            stream: false,
        }
    }

    /// A streamed request.
    pub fn streaming(body: Value) -> Self {
        Self { body, stream: true }
    }
}

/// Scratch state an adapter keeps across the frames of one streamed round.
///
/// A fresh state is created for every round.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    /// Adapter-defined string slots (e.g. the last `event:` line).
    pub slots: HashMap<String, String>,

    /// Adapter-defined counters (e.g. the next block index to assign).
    pub counters: HashMap<String, u64>,
}

impl FrameState {
    /// Store a string slot, returning the previous value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.slots.insert(key.to_owned(), value.into())
    }

    /// Remove and return a string slot.
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.slots.remove(key)
    }

    /// Return the current counter value and increment it.
    pub fn next(&mut self, key: &str) -> u64 {
        let counter = self.counters.entry(key.to_owned()).or_default();
        let value = *counter;
        *counter += 1;
        value
    }
}

/// Translates between the engine's provider-agnostic types and one
/// provider's wire format.
pub trait ProviderAdapter: Send + Sync {
    /// Provider tag stamped onto the function calls this adapter produces.
    fn name(&self) -> &str;

    /// Build the request for one round.
    ///
    /// `functions` is empty when the round must not offer function calling
    /// (e.g. structured-output repair rounds).
    fn build_request(
        &self,
        history: &[Message],
        policy: &FunctionCallingPolicy,
        functions: &[FunctionDefinition],
        stream: bool,
    ) -> Result<ProviderRequest>;

    /// Parse a complete, non-streamed response.
    fn parse_response(&self, raw: &Value) -> Result<ProviderReply>;

    /// Parse one raw stream frame into zero or more events.
    fn parse_stream_frame(&self, frame: &str, state: &mut FrameState) -> Result<Vec<FrameEvent>>;
}
