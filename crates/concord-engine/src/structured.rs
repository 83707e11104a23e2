//! Structured output: schema generation, extraction and bounded repair.
//!
//! Attempt 1 parses the raw answer.  Each failed attempt, while repairs
//! remain, sends one non-streamed correction round carrying the previous
//! output and the exact parse error, then retries with the corrected text.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::engine::EngineInner;
use crate::error::{EngineError, Result, StructuredOutputDiagnostics};
use crate::executor::RoundExecutor;
use crate::policy::FunctionCallingPolicy;
use crate::types::Message;

const REPAIR_SYSTEM_PROMPT: &str = "You correct malformed structured output. \
Reply with a single JSON value only, with no commentary and no markdown fences.";

/// Generate the JSON schema document for `T`.
pub fn schema_for<T: JsonSchema>() -> Result<Value> {
    Ok(serde_json::to_value(schemars::schema_for!(T))?)
}

/// Isolate the JSON payload inside free-form model output.
///
/// Strips a markdown code fence (with or without a language tag) and then
/// narrows to the outermost object or array.  Returns the trimmed input when
/// no structure is found.
pub fn extract_json(text: &str) -> &str {
    let mut candidate = text.trim();

    if let Some(start) = candidate.find("```") {
        let after = &candidate[start + 3..];
        // Skip a language tag such as `json` on the opening fence line.
        let body = match after.find('\n') {
            Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
                &after[nl + 1..]
            }
            _ => after,
        };
        if let Some(end) = body.find("```") {
            candidate = body[..end].trim();
        }
    }

    isolate_structure(candidate).unwrap_or(candidate)
}

/// Pick the outermost JSON structure in `text`.
///
/// Every top-level balanced `{..}` or `[..]` span is a candidate.  The
/// longest one that parses as JSON wins, so bracketed prose such as `[1]`
/// next to the payload is ignored.
fn isolate_structure(text: &str) -> Option<&str> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find(['{', '[']) {
        let start = pos + offset;
        match balanced_end(text, start) {
            Some(end) => {
                spans.push(&text[start..=end]);
                pos = end + 1;
            }
            None => pos = start + 1,
        }
    }

    spans
        .iter()
        .copied()
        .filter(|span| serde_json::from_str::<Value>(span).is_ok())
        .max_by_key(|span| span.len())
        .or_else(|| spans.iter().copied().max_by_key(|span| span.len()))
}

/// Byte index of the bracket closing the one at `start`, skipping string
/// literals.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => closers.push(b'}'),
            b'[' => closers.push(b']'),
            b'}' | b']' => {
                if closers.pop() != Some(b) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Append output instructions and the target schema to a user message.
pub fn structured_prompt(message: &str, schema: &Value) -> String {
    let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{message}\n\nRespond with only a JSON value conforming to this JSON schema:\n\
         ```json\n{schema}\n```"
    )
}

fn repair_prompt(schema: &Value, previous: &str, error: &str) -> String {
    format!(
        "Your previous output did not conform to the required JSON schema.\n\n\
         Schema:\n{schema}\n\n\
         Previous output:\n{previous}\n\n\
         Parse error: {error}\n\n\
         Emit only corrected JSON that conforms to the schema."
    )
}

/// Parses raw model output into a target shape, repairing it when needed.
#[derive(Clone)]
pub(crate) struct StructuredResolver {
    inner: Arc<EngineInner>,
    policy: FunctionCallingPolicy,
    cancel: Option<CancellationToken>,
    max_repairs: u32,
    shape_name: String,
    schema: Value,
}

impl StructuredResolver {
    pub(crate) fn for_shape<T: JsonSchema>(
        inner: Arc<EngineInner>,
        policy: FunctionCallingPolicy,
        cancel: Option<CancellationToken>,
        max_repairs: u32,
    ) -> Result<Self> {
        Ok(Self {
            inner,
            policy,
            cancel,
            max_repairs,
            shape_name: T::schema_name().to_string(),
            schema: schema_for::<T>()?,
        })
    }

    pub(crate) fn schema(&self) -> &Value {
        &self.schema
    }

    /// Parse `raw` into `T`, running up to `max_repairs` correction rounds.
    pub(crate) async fn resolve<T: DeserializeOwned>(&self, raw: String) -> Result<T> {
        let first_raw = raw.clone();
        let mut working = raw;
        let mut attempt: u32 = 1;

        loop {
            let error = match serde_json::from_str::<T>(extract_json(&working)) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(shape = %self.shape_name, attempt, "structured output repaired");
                    }
                    return Ok(value);
                }
                Err(e) => e.to_string(),
            };

            if attempt > self.max_repairs {
                tracing::warn!(
                    shape = %self.shape_name,
                    attempts = attempt,
                    error = %error,
                    "structured output repair exhausted"
                );
                return Err(EngineError::StructuredOutputFailure(Box::new(
                    StructuredOutputDiagnostics {
                        shape_name: self.shape_name.clone(),
                        schema: self.schema.clone(),
                        first_raw,
                        last_raw: working,
                        last_error: error,
                        attempts: attempt,
                    },
                )));
            }

            tracing::debug!(shape = %self.shape_name, attempt, error = %error, "structured output invalid, repairing");
            working = self.repair(&working, &error).await?;
            attempt += 1;
        }
    }

    /// One non-streamed correction round on a scratch conversation.
    async fn repair(&self, previous: &str, error: &str) -> Result<String> {
        let conversation = Conversation::with_system(REPAIR_SYSTEM_PROMPT);
        conversation.push(Message::user(repair_prompt(&self.schema, previous, error)));

        let executor = RoundExecutor::new(
            Arc::clone(&self.inner),
            self.policy.clone().with_max_rounds(1),
            self.cancel.clone(),
        )?
        .without_functions();

        match executor.run(&conversation).await {
            Ok(outcome) => Ok(outcome.text),
            // A model that insists on calling functions still gave us text to retry.
            Err(EngineError::RoundsExceeded { partial_text, .. }) => Ok(partial_text),
            Err(e) => Err(e),
        }
    }
}
