//! Public entry points.
//!
//! An [`Engine`] binds a provider adapter, a transport, the caller's functions
//! and the service-wide [`EngineConfig`].  Every entry point takes its policy
//! explicitly through [`CallOptions`]; nothing is stored between calls.

use std::sync::Arc;

use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::conversation::Conversation;
use crate::decoupled::{DecoupledRun, Resolver};
use crate::error::{EngineError, Result};
use crate::executor::{RoundExecutor, RunOutcome};
use crate::functions::{FunctionHandler, FunctionRegistry};
use crate::policy::{FunctionCallingPolicy, StructuredOutputPolicy};
use crate::provider::ProviderAdapter;
use crate::stream::{EventStream, spawn_run};
use crate::structured::{StructuredResolver, structured_prompt};
use crate::transport::Transport;
use crate::types::Message;

/// Per-call options shared by every entry point.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Round-loop policy.  `None` uses [`EngineConfig::default_policy`].
    pub policy: Option<FunctionCallingPolicy>,

    /// Run against a scratch copy of the conversation carrying only its
    /// system message; the caller's history is left untouched.
    pub stateless: bool,

    /// External cancellation signal.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Options using the engine defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit policy.
    pub fn with_policy(mut self, policy: FunctionCallingPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Enable or disable stateless mode.
    pub fn stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) struct EngineInner {
    pub(crate) adapter: Arc<dyn ProviderAdapter>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) config: EngineConfig,
}

/// The completion-orchestration engine.  Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("provider", &self.inner.adapter.name())
            .field("functions", &self.inner.functions)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Engine {
    /// Start building an engine for one provider.
    pub fn builder(
        adapter: Arc<dyn ProviderAdapter>,
        transport: Arc<dyn Transport>,
    ) -> EngineBuilder {
        EngineBuilder {
            adapter,
            transport,
            functions: FunctionRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    /// The service-wide configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The registered functions.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.inner.functions
    }

    /// A new conversation carrying the configured system prompt.
    pub fn conversation(&self) -> Conversation {
        match &self.inner.config.system_prompt {
            Some(prompt) => Conversation::with_system(prompt.clone()),
            None => Conversation::new(),
        }
    }

    /// Run the full round loop and return the final answer.
    ///
    /// # Errors
    ///
    /// Fails fast with the typed error of whichever layer failed; see
    /// [`EngineError`].
    pub async fn complete(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
    ) -> Result<String> {
        self.complete_with_outcome(conversation, message, options)
            .await
            .map(|outcome| outcome.text)
    }

    /// Like [`complete`](Self::complete) but also reports the round count and
    /// run id.
    pub async fn complete_with_outcome(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
    ) -> Result<RunOutcome> {
        let (executor, target) = self.start_run(conversation, message, options)?;
        executor.run(&target).await
    }

    /// Run the round loop in the background and return the live event feed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
    ) -> Result<EventStream> {
        let (executor, target) = self.start_run(conversation, message, options)?;
        Ok(spawn_run(executor, target)?.events)
    }

    /// Complete and parse the answer into `T`, repairing invalid output with
    /// up to [`StructuredOutputPolicy::max_repair_attempts`] correction rounds.
    pub async fn complete_structured<T>(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
        output: StructuredOutputPolicy,
    ) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let resolver = self.structured_resolver::<T>(options, output)?;
        let prompt = structured_prompt(message, resolver.schema());
        let raw = self.complete(conversation, &prompt, options).await?;
        resolver.resolve(raw).await
    }

    /// Start a streamed run whose resolved value is the final answer text.
    pub fn begin_stream(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
    ) -> Result<DecoupledRun<String>> {
        let (options, token) = Self::decoupled_options(options);
        let resolver: Resolver<String> =
            Arc::new(|text: String| async move { Ok::<_, EngineError>(text) }.boxed());
        self.begin(conversation, message, &options, token, resolver)
    }

    /// Start a streamed run whose resolved value is the answer parsed into
    /// `T` (with repair rounds when needed).
    pub fn begin_stream_structured<T>(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
        output: StructuredOutputPolicy,
    ) -> Result<DecoupledRun<T>>
    where
        T: DeserializeOwned + JsonSchema + Send + Sync + 'static,
    {
        let (options, token) = Self::decoupled_options(options);
        let structured = self.structured_resolver::<T>(&options, output)?;
        let prompt = structured_prompt(message, structured.schema());
        let resolver: Resolver<T> = Arc::new(move |text: String| {
            let structured = structured.clone();
            async move { structured.resolve::<T>(text).await }.boxed()
        });
        self.begin(conversation, &prompt, &options, token, resolver)
    }

    /// A decoupled run gets its own token so that cancelling the run does not
    /// cancel the caller's token.
    fn decoupled_options(options: &CallOptions) -> (CallOptions, CancellationToken) {
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        (options.clone().with_cancel(token.clone()), token)
    }

    fn begin<T>(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
        token: CancellationToken,
        resolver: Resolver<T>,
    ) -> Result<DecoupledRun<T>>
    where
        T: Send + Sync + 'static,
    {
        let (executor, target) = self.start_run(conversation, message, options)?;
        let run_id = executor.run_id();
        let spawned = spawn_run(executor, target)?;
        Ok(DecoupledRun::new(run_id, spawned, resolver, token))
    }

    fn structured_resolver<T: JsonSchema>(
        &self,
        options: &CallOptions,
        output: StructuredOutputPolicy,
    ) -> Result<StructuredResolver> {
        StructuredResolver::for_shape::<T>(
            Arc::clone(&self.inner),
            self.policy(options),
            options.cancel.clone(),
            output.effective_repairs(self.inner.config.max_repair_attempts),
        )
    }

    fn policy(&self, options: &CallOptions) -> FunctionCallingPolicy {
        options
            .policy
            .clone()
            .unwrap_or_else(|| self.inner.config.default_policy.clone())
    }

    /// Validate the policy, pick the target conversation and append the
    /// continuation message.
    fn start_run(
        &self,
        conversation: &Conversation,
        message: &str,
        options: &CallOptions,
    ) -> Result<(RoundExecutor, Conversation)> {
        let executor = RoundExecutor::new(
            Arc::clone(&self.inner),
            self.policy(options),
            options.cancel.clone(),
        )?;

        let target = if options.stateless {
            conversation.scratch()
        } else {
            conversation.clone()
        };
        target.push(Message::user(message));

        Ok((executor, target))
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    transport: Arc<dyn Transport>,
    functions: FunctionRegistry,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Register a function handler.
    pub fn function(mut self, handler: Arc<dyn FunctionHandler>) -> Self {
        self.functions.register(handler);
        self
    }

    /// Replace the function registry.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Use a specific configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        tracing::debug!(
            provider = self.adapter.name(),
            functions = self.functions.definitions().len(),
            "engine built"
        );
        Ok(Engine {
            inner: Arc::new(EngineInner {
                adapter: self.adapter,
                transport: self.transport,
                functions: self.functions,
                config: self.config,
            }),
        })
    }
}
