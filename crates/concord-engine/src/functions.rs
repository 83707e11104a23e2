//! Caller-supplied functions the model may invoke.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{FunctionCall, FunctionDefinition};

/// A component that executes function calls on the model's behalf.
///
/// One handler may expose several functions.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// The functions this handler exposes to the model.
    fn definitions(&self) -> Vec<FunctionDefinition>;

    /// Execute a named function.  The returned string is threaded back to the
    /// model verbatim.
    async fn call(&self, name: &str, arguments: Value) -> Result<String>;
}

/// The outcome of invoking one function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOutcome {
    /// Text fed back to the model.
    pub content: String,

    /// Whether the call failed (unknown function or handler error).
    pub is_error: bool,
}

/// The set of handlers available to an engine.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: Vec<Arc<dyn FunctionHandler>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field(
                "functions",
                &self.definitions().into_iter().map(|d| d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    pub fn register(&mut self, handler: Arc<dyn FunctionHandler>) {
        self.handlers.push(handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, handler: Arc<dyn FunctionHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Every function definition across all handlers.
    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.handlers.iter().flat_map(|h| h.definitions()).collect()
    }

    /// Find the handler that owns a function name.
    pub fn find(&self, name: &str) -> Option<&Arc<dyn FunctionHandler>> {
        self.handlers
            .iter()
            .find(|h| h.definitions().iter().any(|d| d.name == name))
    }

    /// Execute a call.  Failures are reported back to the model as error
    /// results instead of aborting the run.
    pub async fn invoke(&self, call: &FunctionCall) -> FunctionOutcome {
        let Some(handler) = self.find(&call.name) else {
            tracing::warn!(function = %call.name, call_id = %call.id, "unknown function requested");
            return FunctionOutcome {
                content: format!("Error: unknown function `{}`", call.name),
                is_error: true,
            };
        };

        match handler.call(&call.name, call.arguments.clone()).await {
            Ok(content) => FunctionOutcome {
                content,
                is_error: false,
            },
            Err(e) => {
                tracing::warn!(function = %call.name, call_id = %call.id, error = %e, "function execution failed");
                FunctionOutcome {
                    content: format!("Error: {e}"),
                    is_error: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct Weather;

    #[async_trait]
    impl FunctionHandler for Weather {
        fn definitions(&self) -> Vec<FunctionDefinition> {
            vec![FunctionDefinition {
                name: "get_weather".into(),
                description: "Current weather for a city".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }),
            }]
        }

        async fn call(&self, _name: &str, arguments: Value) -> Result<String> {
            match arguments["city"].as_str() {
                Some(city) => Ok(format!("Sunny in {city}")),
                None => Err(EngineError::Internal("missing city".into())),
            }
        }
    }

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new().with(Arc::new(Weather))
    }

    #[test]
    fn finds_handler_by_function_name() {
        let registry = registry();
        assert!(registry.find("get_weather").is_some());
        assert!(registry.find("nonexistent").is_none());
        assert_eq!(registry.definitions().len(), 1);
    }

    #[tokio::test]
    async fn invoke_returns_handler_output() {
        let call = FunctionCall::new("c1", "get_weather", serde_json::json!({"city": "Oslo"}));
        let outcome = registry().invoke(&call).await;
        assert_eq!(outcome.content, "Sunny in Oslo");
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let call = FunctionCall::new("c1", "get_weather", serde_json::json!({}));
        let outcome = registry().invoke(&call).await;
        assert!(outcome.is_error);
        assert!(outcome.content.starts_with("Error:"), "{}", outcome.content);
    }

    #[tokio::test]
    async fn unknown_function_becomes_error_result() {
        let call = FunctionCall::new("c1", "launch_rocket", serde_json::json!({}));
        let outcome = registry().invoke(&call).await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("launch_rocket"));
    }
}
