//! Streamed round execution.
//!
//! One background producer drains the adapter's frames exactly once per
//! round.  Each frame becomes zero or more [`StreamEvent`]s, which are pushed
//! onto a single-consumer feed while answer text is also accumulated into an
//! [`AnswerBuffer`].  When a round ends with function calls, they are executed
//! exactly as in the non-streamed loop and the next round's events continue on
//! the same feed.  The feed closes after exactly one terminal event.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::error::{EngineError, Result};
use crate::executor::RoundExecutor;
use crate::logging::lifecycle;
use crate::provider::FrameState;
use crate::types::{EventMetadata, FrameEvent, FunctionCall, Message, StreamEvent};

// ---------------------------------------------------------------------------
// Answer buffer
// ---------------------------------------------------------------------------

/// The text of the round currently being streamed.
#[derive(Debug, Clone, Default)]
pub(crate) struct AnswerBuffer(Arc<Mutex<String>>);

impl AnswerBuffer {
    fn lock(&self) -> MutexGuard<'_, String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, delta: &str) {
        self.lock().push_str(delta);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn snapshot(&self) -> String {
        self.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Event feed
// ---------------------------------------------------------------------------

/// The live feed of a streamed run.
///
/// Yields events in production order and ends after the terminal
/// [`StreamEvent::Completion`] or [`StreamEvent::Error`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    run_id: Uuid,
}

impl EventStream {
    /// Identifier of the run producing this feed.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Receive the next event, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the feed to its end.
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Handles to a producer running in the background.
pub(crate) struct SpawnedRun {
    pub(crate) events: EventStream,
    pub(crate) done: oneshot::Receiver<Result<String>>,
    pub(crate) finished: Arc<AtomicBool>,
    pub(crate) buffer: AnswerBuffer,
}

/// Spawn the producer for a run whose continuation message is already on
/// `conversation`.
pub(crate) fn spawn_run(executor: RoundExecutor, conversation: Conversation) -> Result<SpawnedRun> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| EngineError::usage("streaming requires a running Tokio runtime"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let buffer = AnswerBuffer::default();
    let run_id = executor.run_id();

    let producer = Producer {
        executor,
        conversation,
        events: tx,
        buffer: buffer.clone(),
    };
    let finished_flag = Arc::clone(&finished);
    runtime.spawn(async move {
        let result = producer.run().await;
        finished_flag.store(true, Ordering::Release);
        // The run may have been dropped; nobody is waiting then.
        let _ = done_tx.send(result);
    });

    Ok(SpawnedRun {
        events: EventStream { rx, run_id },
        done: done_rx,
        finished,
        buffer,
    })
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct Producer {
    executor: RoundExecutor,
    conversation: Conversation,
    events: mpsc::UnboundedSender<StreamEvent>,
    buffer: AnswerBuffer,
}

/// What a successful streamed run reports on its completion event.
struct StreamSummary {
    text: String,
    rounds: u32,
    model: Option<String>,
    reasoning: String,
}

impl Producer {
    async fn run(self) -> Result<String> {
        let run_id = self.executor.run_id();
        match self.drive().await {
            Ok(summary) => {
                let mut metadata = EventMetadata::new();
                metadata.insert("run_id".into(), json!(run_id.to_string()));
                metadata.insert("rounds".into(), json!(summary.rounds));
                if let Some(model) = summary.model {
                    metadata.insert("model".into(), json!(model));
                }
                if !summary.reasoning.is_empty() {
                    metadata.insert("reasoning".into(), json!(summary.reasoning));
                }
                self.emit(StreamEvent::Completion {
                    text: summary.text.clone(),
                    metadata,
                });
                Ok(summary.text)
            }
            Err(err) => {
                let mut metadata = EventMetadata::new();
                metadata.insert("run_id".into(), json!(run_id.to_string()));
                let outcome = if err.is_cancelled() { "cancelled" } else { "failed" };
                metadata.insert("outcome".into(), json!(outcome));
                if let EngineError::RoundsExceeded { partial_text, .. } = &err {
                    metadata.insert("partial_text".into(), json!(partial_text));
                }
                tracing::warn!(run_id = %run_id, error = %err, "streamed run ended with error");
                self.emit(StreamEvent::Error {
                    message: err.to_string(),
                    metadata,
                });
                Err(err)
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        // A dropped feed must not stop accumulation.
        let _ = self.events.send(event);
    }

    async fn drive(&self) -> Result<StreamSummary> {
        let executor = &self.executor;
        let inner = executor.inner();
        let policy = executor.policy();
        let max_rounds = policy.max_rounds;
        let mut partial_text = String::new();
        let mut reasoning = String::new();
        let mut model = None;

        lifecycle!(
            policy.enable_logging,
            run_id = %executor.run_id(),
            max_rounds,
            streamed = true,
            "starting function-calling loop"
        );

        for round in 1..=max_rounds {
            tracing::debug!(run_id = %executor.run_id(), round, "streamed round start");
            self.buffer.clear();

            let request = executor.build_request(&self.conversation, true)?;
            let deadline = executor.deadline();
            let mut frames = executor
                .guard(inner.transport.open_stream(&request), deadline)
                .await??;

            let mut state = FrameState::default();
            let mut turn = RoundAccumulator::new(self.buffer.clone());

            while !turn.done {
                let Some(frame) = executor.guard(frames.next(), deadline).await? else {
                    break;
                };
                for event in inner.adapter.parse_stream_frame(&frame?, &mut state)? {
                    if let Some(out) = turn.apply(event)? {
                        self.emit(out);
                    }
                }
            }

            if turn.model.is_some() {
                model = turn.model.take();
            }
            reasoning.push_str(&turn.reasoning);
            let text = self.buffer.snapshot();
            let calls = executor.normalize_calls(turn.finish_calls()?)?;

            if calls.is_empty() {
                self.conversation.push(Message::assistant(&text));
                lifecycle!(
                    policy.enable_logging,
                    run_id = %executor.run_id(),
                    rounds = round,
                    "streamed loop completed with text response"
                );
                return Ok(StreamSummary {
                    text,
                    rounds: round,
                    model,
                    reasoning,
                });
            }

            partial_text.push_str(&text);
            lifecycle!(
                policy.enable_logging,
                run_id = %executor.run_id(),
                round,
                call_count = calls.len(),
                "provider requested function calls"
            );

            if round == max_rounds {
                break;
            }

            executor
                .execute_calls(&calls, &text, &self.conversation, |call, outcome| {
                    let mut metadata = EventMetadata::new();
                    metadata.insert("round".into(), json!(round));
                    metadata.insert("is_error".into(), json!(outcome.is_error));
                    self.emit(StreamEvent::FunctionResult {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        result: outcome.content.clone(),
                        metadata,
                    });
                })
                .await?;
        }

        Err(EngineError::RoundsExceeded {
            max_rounds,
            partial_text,
        })
    }
}

// ---------------------------------------------------------------------------
// Round accumulator
// ---------------------------------------------------------------------------

/// A function call being assembled from stream fragments.
#[derive(Debug)]
struct PendingCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
    parsed: Option<Value>,
}

/// Folds one round's frame events into text, reasoning and function calls.
#[derive(Debug)]
struct RoundAccumulator {
    buffer: AnswerBuffer,
    reasoning: String,
    calls: Vec<PendingCall>,
    model: Option<String>,
    done: bool,
}

impl RoundAccumulator {
    fn new(buffer: AnswerBuffer) -> Self {
        Self {
            buffer,
            reasoning: String::new(),
            calls: Vec::new(),
            model: None,
            done: false,
        }
    }

    /// Apply one frame event, returning the public event to emit, if any.
    fn apply(&mut self, event: FrameEvent) -> Result<Option<StreamEvent>> {
        match event {
            FrameEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return Ok(None);
                }
                self.buffer.push(&delta);
                Ok(Some(StreamEvent::Text {
                    delta,
                    metadata: EventMetadata::new(),
                }))
            }

            FrameEvent::ReasoningDelta(delta) => {
                if delta.is_empty() {
                    return Ok(None);
                }
                self.reasoning.push_str(&delta);
                Ok(Some(StreamEvent::Reasoning {
                    delta,
                    metadata: EventMetadata::new(),
                }))
            }

            FrameEvent::CallStart { index, id, name } => {
                // Edge-triggered: a repeated start for an open block is ignored.
                if self.calls.iter().any(|c| c.index == index) {
                    return Ok(None);
                }
                let mut metadata = EventMetadata::new();
                metadata.insert("index".into(), json!(index));
                let event = StreamEvent::FunctionCallStarted {
                    call_id: id.clone(),
                    name: name.clone(),
                    metadata,
                };
                self.calls.push(PendingCall {
                    index,
                    id,
                    name,
                    arguments: String::new(),
                    parsed: None,
                });
                Ok(Some(event))
            }

            FrameEvent::CallArgumentsDelta { index, fragment } => {
                match self.calls.iter_mut().find(|c| c.index == index) {
                    Some(call) => call.arguments.push_str(&fragment),
                    None => tracing::warn!(index, "argument delta for unknown call block"),
                }
                Ok(None)
            }

            FrameEvent::BlockEnd { index } => {
                if let Some(call) = self.calls.iter_mut().find(|c| c.index == index)
                    && call.parsed.is_none()
                {
                    call.parsed = parse_arguments(&call.arguments).ok();
                }
                Ok(None)
            }

            FrameEvent::Model(model) => {
                self.model = Some(model);
                Ok(None)
            }

            FrameEvent::Done => {
                self.done = true;
                Ok(None)
            }

            FrameEvent::Failed(reason) => Err(EngineError::Transport { reason }),
        }
    }

    /// Close the round.  Calls whose block never ended are closed implicitly;
    /// any call whose arguments do not parse is rejected.
    fn finish_calls(&mut self) -> Result<Vec<FunctionCall>> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|call| {
                let arguments = match call.parsed {
                    Some(value) => value,
                    None => parse_arguments(&call.arguments).map_err(|e| {
                        EngineError::MalformedFunctionCall {
                            name: call.name.clone(),
                            reason: format!("arguments are not valid JSON: {e}"),
                        }
                    })?,
                };
                Ok(FunctionCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                    source: None,
                })
            })
            .collect()
    }
}

fn parse_arguments(text: &str) -> serde_json::Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator() -> RoundAccumulator {
        RoundAccumulator::new(AnswerBuffer::default())
    }

    #[test]
    fn text_deltas_accumulate_and_emit() {
        let mut acc = accumulator();
        let first = acc.apply(FrameEvent::TextDelta("Hel".into())).unwrap();
        acc.apply(FrameEvent::TextDelta("lo".into())).unwrap();

        assert_eq!(first, Some(StreamEvent::text("Hel")));
        assert_eq!(acc.buffer.snapshot(), "Hello");
    }

    #[test]
    fn reasoning_is_kept_out_of_the_answer_buffer() {
        let mut acc = accumulator();
        let event = acc
            .apply(FrameEvent::ReasoningDelta("thinking".into()))
            .unwrap();
        assert!(matches!(event, Some(StreamEvent::Reasoning { .. })));
        assert!(acc.buffer.snapshot().is_empty());
        assert_eq!(acc.reasoning, "thinking");
    }

    #[test]
    fn call_started_is_edge_triggered() {
        let mut acc = accumulator();
        let start = FrameEvent::CallStart {
            index: 1,
            id: "toolu_1".into(),
            name: "lookup".into(),
        };
        assert!(matches!(
            acc.apply(start.clone()).unwrap(),
            Some(StreamEvent::FunctionCallStarted { .. })
        ));
        assert!(acc.apply(start).unwrap().is_none());
        for fragment in [r#"{"q":"#, r#""rust"}"#] {
            let delta = FrameEvent::CallArgumentsDelta {
                index: 1,
                fragment: fragment.into(),
            };
            assert!(acc.apply(delta).unwrap().is_none());
        }
        acc.apply(FrameEvent::BlockEnd { index: 1 }).unwrap();

        let calls = acc.finish_calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].arguments["q"], "rust");
    }

    #[test]
    fn open_call_is_closed_at_round_end() {
        let mut acc = accumulator();
        acc.apply(FrameEvent::CallStart {
            index: 0,
            id: "call_a".into(),
            name: "noop".into(),
        })
        .unwrap();

        let calls = acc.finish_calls().unwrap();
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn unparseable_arguments_are_malformed() {
        let mut acc = accumulator();
        acc.apply(FrameEvent::CallStart {
            index: 0,
            id: "call_a".into(),
            name: "broken".into(),
        })
        .unwrap();
        acc.apply(FrameEvent::CallArgumentsDelta {
            index: 0,
            fragment: r#"{"unterminated"#.into(),
        })
        .unwrap();
        acc.apply(FrameEvent::BlockEnd { index: 0 }).unwrap();

        let err = acc.finish_calls().unwrap_err();
        assert!(matches!(err, EngineError::MalformedFunctionCall { .. }));
    }

    #[test]
    fn provider_failure_is_transport_error() {
        let mut acc = accumulator();
        let err = acc
            .apply(FrameEvent::Failed("overloaded".into()))
            .unwrap_err();
        assert!(err.is_transport());
    }
}
