//! Model-agnostic completion orchestration.
//!
//! This crate drives a conversation with a language-model provider through
//! repeated request/response rounds until it produces a final answer, runs
//! caller-supplied functions the model asks for, streams the run live, and
//! turns free-text answers into typed values with bounded self-repair.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────────┐
//!                 │   StructuredResolver   │  (schema, extract, repair)
//!                 └───────────┬────────────┘
//!                             │
//!          ┌──────────────────┴──────────────────┐
//!          │                                     │
//!   ┌──────┴───────┐                    ┌────────┴────────┐
//!   │ complete()   │                    │ stream() /      │
//!   │              │                    │ begin_stream()  │
//!   └──────┬───────┘                    └────────┬────────┘
//!          │                                     │ background producer
//!          └──────────────┬──────────────────────┘
//!                  ┌──────┴───────┐     ┌──────────────────┐
//!                  │ RoundExecutor│────>│ FunctionRegistry │
//!                  └──────┬───────┘     └──────────────────┘
//!                  ┌──────┴───────┐     ┌──────────────────┐
//!                  │ProviderAdapter────>│    Transport     │
//!                  └──────────────┘     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] -- Public entry points and per-call options.
//! - [`executor`] -- The round-based function-calling loop.
//! - [`stream`] -- Streamed rounds and the live event feed.
//! - [`decoupled`] -- Runs whose live feed and final value are independent.
//! - [`structured`] -- Schema generation, JSON extraction and repair.
//! - [`provider`] / [`transport`] -- Contracts for provider collaborators.
//! - [`error`] -- Engine error types.

pub mod config;
pub mod conversation;
pub mod decoupled;
pub mod engine;
pub mod error;
pub mod executor;
pub mod functions;
pub mod logging;
pub mod policy;
pub mod provider;
pub mod stream;
pub mod structured;
pub mod transport;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use config::EngineConfig;
pub use conversation::Conversation;
pub use decoupled::DecoupledRun;
pub use engine::{CallOptions, Engine, EngineBuilder};
pub use error::{EngineError, Result, StructuredOutputDiagnostics};
pub use executor::{META_ASSISTANT_TEXT, RunOutcome};
pub use functions::{FunctionHandler, FunctionOutcome, FunctionRegistry};
pub use logging::init_tracing;
pub use policy::{FunctionCallingPolicy, StructuredOutputPolicy};
pub use provider::{FrameState, ProviderAdapter, ProviderRequest};
pub use stream::EventStream;
pub use structured::{extract_json, schema_for, structured_prompt};
pub use transport::{FrameSplitter, FrameStream, HttpTransport, MAX_LINE_BYTES, Transport};
pub use types::{
    EventMetadata, FrameEvent, FunctionCall, FunctionDefinition, Message, ProviderReply, Role,
    StreamEvent,
};

/// Re-exported so callers can cancel runs without naming `tokio-util`.
pub use tokio_util::sync::CancellationToken;
