//! The round-based function-calling loop.
//!
//! ```text
//! Start ─> AwaitingProviderResponse ─┬─> Done (final text)
//!              ^                     │
//!              └─ ExecutingFunctions <┘   (one or more calls)
//!                                    └─> Failed (transport, malformed call,
//!                                        rounds exceeded, cancelled)
//! ```
//!
//! Calls returned in one response are executed sequentially, in the order the
//! provider returned them.  Each call appends a call message followed by a
//! result message before the next call starts.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::functions::FunctionOutcome;
use crate::logging::lifecycle;
use crate::policy::FunctionCallingPolicy;
use crate::provider::ProviderRequest;
use crate::types::{FunctionCall, Message};

/// Metadata key on the first call message of a round holding any assistant
/// text the provider returned alongside its function calls.
pub const META_ASSISTANT_TEXT: &str = "assistant_text";

/// The result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The final answer.
    pub text: String,

    /// Provider round-trips performed.
    pub rounds: u32,

    /// Identifier used in this run's log events.
    pub run_id: Uuid,
}

/// Drives one logical completion against a conversation.
#[derive(Clone)]
pub(crate) struct RoundExecutor {
    inner: Arc<EngineInner>,
    policy: FunctionCallingPolicy,
    cancel: Option<CancellationToken>,
    offer_functions: bool,
    run_id: Uuid,
}

impl RoundExecutor {
    /// Create an executor, rejecting invalid policies up front.
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        policy: FunctionCallingPolicy,
        cancel: Option<CancellationToken>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            inner,
            policy,
            cancel,
            offer_functions: true,
            run_id: Uuid::now_v7(),
        })
    }

    /// Do not offer any functions to the provider.
    pub(crate) fn without_functions(mut self) -> Self {
        self.offer_functions = false;
        self
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub(crate) fn policy(&self) -> &FunctionCallingPolicy {
        &self.policy
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run the loop until a final answer or a bounded failure.
    ///
    /// The caller must already have appended the continuation message.
    pub(crate) async fn run(&self, conversation: &Conversation) -> Result<RunOutcome> {
        let max_rounds = self.policy.max_rounds;
        let mut partial_text = String::new();

        lifecycle!(
            self.policy.enable_logging,
            run_id = %self.run_id,
            max_rounds,
            streamed = false,
            "starting function-calling loop"
        );

        for round in 1..=max_rounds {
            tracing::debug!(run_id = %self.run_id, round, "round start");

            let request = self.build_request(conversation, false)?;
            let raw = self
                .guard(self.inner.transport.send(&request), self.deadline())
                .await??;
            let reply = self.inner.adapter.parse_response(&raw)?;

            if reply.function_calls.is_empty() {
                conversation.push(Message::assistant(&reply.text));
                lifecycle!(
                    self.policy.enable_logging,
                    run_id = %self.run_id,
                    rounds = round,
                    "function-calling loop completed with text response"
                );
                return Ok(RunOutcome {
                    text: reply.text,
                    rounds: round,
                    run_id: self.run_id,
                });
            }

            let calls = self.normalize_calls(reply.function_calls)?;
            partial_text.push_str(&reply.text);

            lifecycle!(
                self.policy.enable_logging,
                run_id = %self.run_id,
                round,
                call_count = calls.len(),
                functions = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "provider requested function calls"
            );

            if round == max_rounds {
                break;
            }

            self.execute_calls(&calls, &reply.text, conversation, |_, _| {})
                .await?;
        }

        tracing::warn!(run_id = %self.run_id, max_rounds, "function-calling loop exceeded max rounds");
        Err(EngineError::RoundsExceeded {
            max_rounds,
            partial_text,
        })
    }

    /// Build the provider request for the next round from the current history.
    pub(crate) fn build_request(
        &self,
        conversation: &Conversation,
        stream: bool,
    ) -> Result<ProviderRequest> {
        let functions = if self.offer_functions {
            self.inner.functions.definitions()
        } else {
            Vec::new()
        };
        self.inner
            .adapter
            .build_request(&conversation.messages(), &self.policy, &functions, stream)
    }

    /// Reject calls that cannot be routed back and stamp the provider tag.
    pub(crate) fn normalize_calls(&self, calls: Vec<FunctionCall>) -> Result<Vec<FunctionCall>> {
        calls
            .into_iter()
            .map(|mut call| {
                if call.id.trim().is_empty() {
                    return Err(EngineError::MalformedFunctionCall {
                        name: call.name,
                        reason: "missing correlation id".into(),
                    });
                }
                if call.source.is_none() {
                    call.source = Some(self.inner.adapter.name().to_owned());
                }
                Ok(call)
            })
            .collect()
    }

    /// Execute calls strictly in order, appending `[call, result]` per call.
    ///
    /// `assistant_text` is any text the provider returned alongside the calls;
    /// it is kept on the first call message.
    pub(crate) async fn execute_calls<F>(
        &self,
        calls: &[FunctionCall],
        assistant_text: &str,
        conversation: &Conversation,
        mut on_result: F,
    ) -> Result<()>
    where
        F: FnMut(&FunctionCall, &FunctionOutcome),
    {
        for (i, call) in calls.iter().enumerate() {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(EngineError::Cancelled);
            }

            let mut call_msg = Message::function_call(call);
            if i == 0 && !assistant_text.is_empty() {
                call_msg = call_msg.with_metadata(META_ASSISTANT_TEXT, assistant_text);
            }
            conversation.push(call_msg);

            lifecycle!(
                self.policy.enable_logging,
                run_id = %self.run_id,
                function = %call.name,
                call_id = %call.id,
                "executing function"
            );

            let outcome = self.guard(self.inner.functions.invoke(call), None).await?;
            conversation.push(Message::function_result(
                call,
                &outcome.content,
                outcome.is_error,
            ));
            on_result(call, &outcome);
        }
        Ok(())
    }

    /// Deadline for one provider request, if a timeout is configured.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.policy.timeout.map(|t| Instant::now() + t)
    }

    /// Await `fut`, honoring cancellation and an optional deadline.
    pub(crate) async fn guard<F: Future>(
        &self,
        fut: F,
        deadline: Option<Instant>,
    ) -> Result<F::Output> {
        let timed = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
                    EngineError::Timeout {
                        seconds: self.policy.timeout.map_or(0, |t| t.as_secs()),
                    }
                }),
                None => Ok(fut.await),
            }
        };

        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(EngineError::Cancelled),
                result = timed => result,
            },
            None => timed.await,
        }
    }
}
