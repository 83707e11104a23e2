//! Core types for completion orchestration.
//!
//! These types are provider-agnostic.  Provider adapters translate them into
//! wire formats at the edges; nothing here names a provider's vocabulary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Metadata key holding the function name on call/result messages.
pub const META_FUNCTION_NAME: &str = "function_name";
/// Metadata key holding the opaque correlation id on call/result messages.
pub const META_FUNCTION_ID: &str = "function_id";
/// Metadata key holding the provider tag a function call came from.
pub const META_SOURCE: &str = "source";
/// Metadata key distinguishing message subtypes that share a role.
pub const META_SUBTYPE: &str = "subtype";
/// Metadata key set to `"true"` on function results that report a failure.
pub const META_IS_ERROR: &str = "is_error";

/// Subtype of an assistant message that records a function call.
pub const SUBTYPE_FUNCTION_CALL: &str = "function_call";
/// Subtype of a function message carrying a function's result.
pub const SUBTYPE_FUNCTION_RESULT: &str = "function_result";

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Instructions that shape model behavior.
    System,
    /// Function-call bookkeeping fed back to the model.
    Function,
}

/// A single entry in a conversation history.
///
/// Messages are appended, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Textual content.  For function-call messages this is the serialized
    /// argument object.
    #[serde(default)]
    pub content: String,

    /// Function name/id, source tag and message subtype.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create the assistant message recording a requested function call.
    pub fn function_call(call: &FunctionCall) -> Self {
        let mut msg = Self::new(Role::Assistant, call.arguments.to_string());
        msg.tag_function(call, SUBTYPE_FUNCTION_CALL);
        msg
    }

    /// Create the function message carrying a call's result.
    pub fn function_result(call: &FunctionCall, content: impl Into<String>, is_error: bool) -> Self {
        let mut msg = Self::new(Role::Function, content);
        msg.tag_function(call, SUBTYPE_FUNCTION_RESULT);
        if is_error {
            msg.metadata.insert(META_IS_ERROR.into(), "true".into());
        }
        msg
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn tag_function(&mut self, call: &FunctionCall, subtype: &str) {
        self.metadata
            .insert(META_FUNCTION_NAME.into(), call.name.clone());
        self.metadata.insert(META_FUNCTION_ID.into(), call.id.clone());
        self.metadata.insert(META_SUBTYPE.into(), subtype.into());
        if let Some(source) = &call.source {
            self.metadata.insert(META_SOURCE.into(), source.clone());
        }
    }

    /// The function name, for call and result messages.
    pub fn function_name(&self) -> Option<&str> {
        self.metadata.get(META_FUNCTION_NAME).map(String::as_str)
    }

    /// The opaque correlation id, for call and result messages.
    pub fn function_id(&self) -> Option<&str> {
        self.metadata.get(META_FUNCTION_ID).map(String::as_str)
    }

    /// The provider tag the originating call came from.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE).map(String::as_str)
    }

    /// The message subtype, if any.
    pub fn subtype(&self) -> Option<&str> {
        self.metadata.get(META_SUBTYPE).map(String::as_str)
    }

    /// Whether this message records a function call.
    pub fn is_function_call(&self) -> bool {
        self.subtype() == Some(SUBTYPE_FUNCTION_CALL)
    }

    /// Whether this message carries a function result.
    pub fn is_function_result(&self) -> bool {
        self.subtype() == Some(SUBTYPE_FUNCTION_RESULT)
    }

    /// Rebuild the [`FunctionCall`] a call message was created from.
    ///
    /// Returns `None` for any other kind of message.
    pub fn to_function_call(&self) -> Option<FunctionCall> {
        if !self.is_function_call() {
            return None;
        }
        Some(FunctionCall {
            id: self.function_id()?.to_owned(),
            name: self.function_name()?.to_owned(),
            arguments: serde_json::from_str(&self.content).unwrap_or(Value::Null),
            source: self.source().map(str::to_owned),
        })
    }
}

// ---------------------------------------------------------------------------
// Function calls
// ---------------------------------------------------------------------------

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Opaque cross-provider correlation id.
    pub id: String,

    /// Name of the function to invoke.
    pub name: String,

    /// Structured arguments.
    pub arguments: Value,

    /// Tag of the provider that issued the call, so the id can be translated
    /// back to that provider's native field on the next round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FunctionCall {
    /// Create a call without a source tag.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            source: None,
        }
    }

    /// Tag the call with the provider that issued it.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Unique function name.
    pub name: String,

    /// What the function does, for the model.
    pub description: String,

    /// JSON Schema of the argument object.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Provider replies
// ---------------------------------------------------------------------------

/// A parsed, non-streamed provider response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReply {
    /// Assistant text (possibly empty when only calls were returned).
    pub text: String,

    /// Function calls in provider-returned order.
    pub function_calls: Vec<FunctionCall>,

    /// Model identity reported by the provider, when known.
    pub model: Option<String>,
}

impl ProviderReply {
    /// A reply carrying only final text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A reply requesting function calls.
    pub fn calls(function_calls: Vec<FunctionCall>) -> Self {
        Self {
            function_calls,
            ..Self::default()
        }
    }
}

/// What a provider adapter extracts from one raw stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A chunk of answer text.
    TextDelta(String),

    /// A chunk of model reasoning.
    ReasoningDelta(String),

    /// A function-call block opened.
    CallStart {
        /// Block index used to correlate later argument deltas.
        index: u32,
        /// Correlation id (may be empty if the provider omitted it).
        id: String,
        /// Function name.
        name: String,
    },

    /// A fragment of a call's JSON argument text.
    CallArgumentsDelta { index: u32, fragment: String },

    /// A content block closed.
    BlockEnd { index: u32 },

    /// Model identity hint.
    Model(String),

    /// The provider signalled the end of this response.
    Done,

    /// The provider reported an error inside the stream.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Free-form metadata attached to a [`StreamEvent`].
pub type EventMetadata = BTreeMap<String, Value>;

/// An event delivered on a live event feed.
///
/// Every logical run ends with exactly one terminal event
/// ([`StreamEvent::Completion`] or [`StreamEvent::Error`]).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental chunk of answer text.
    Text { delta: String, metadata: EventMetadata },

    /// An incremental chunk of model reasoning.
    Reasoning { delta: String, metadata: EventMetadata },

    /// The model started a function call (emitted once per call).
    FunctionCallStarted {
        call_id: String,
        name: String,
        metadata: EventMetadata,
    },

    /// A function finished and its result was threaded back.
    FunctionResult {
        call_id: String,
        name: String,
        result: String,
        metadata: EventMetadata,
    },

    /// The run produced its final answer.
    Completion { text: String, metadata: EventMetadata },

    /// The run failed.
    Error { message: String, metadata: EventMetadata },
}

impl StreamEvent {
    /// Text delta without metadata.
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text {
            delta: delta.into(),
            metadata: EventMetadata::new(),
        }
    }

    /// Whether this event closes the feed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. } | Self::Error { .. })
    }

    /// The event's metadata.
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::Text { metadata, .. }
            | Self::Reasoning { metadata, .. }
            | Self::FunctionCallStarted { metadata, .. }
            | Self::FunctionResult { metadata, .. }
            | Self::Completion { metadata, .. }
            | Self::Error { metadata, .. } => metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
