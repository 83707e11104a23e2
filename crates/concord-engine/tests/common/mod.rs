//! Shared fixtures: a scripted transport, a JSON stub adapter and a few
//! function handlers.
//!
//! The stub adapter speaks a tiny wire format:
//!
//! - non-streamed responses: `{"text": "...", "calls": [{"id", "name", "arguments"}], "model": "..."}`
//! - stream frames: `{"type": "text" | "reasoning" | "call_start" | "args" | "block_end" | "model" | "done" | "error", ...}`

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use concord_engine::{
    Engine, EngineConfig, EngineError, FrameEvent, FrameState, FrameStream, FunctionCall,
    FunctionCallingPolicy, FunctionDefinition, FunctionHandler, Message, ProviderAdapter,
    ProviderReply, ProviderRequest, Result, Transport,
};

// ═══════════════════════════════════════════════════════════════════════
//  Stub adapter
// ═══════════════════════════════════════════════════════════════════════

pub struct StubAdapter;

impl ProviderAdapter for StubAdapter {
    fn name(&self) -> &str {
        "stub"
    }

    fn build_request(
        &self,
        history: &[Message],
        policy: &FunctionCallingPolicy,
        functions: &[FunctionDefinition],
        stream: bool,
    ) -> Result<ProviderRequest> {
        let messages: Vec<Value> = history
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let names: Vec<&str> = functions.iter().map(|f| f.name.as_str()).collect();
        let body = json!({
            "messages": messages,
            "functions": names,
            "max_concurrency": policy.max_concurrency,
        });
        Ok(if stream {
            ProviderRequest::streaming(body)
        } else {
            ProviderRequest::new(body)
        })
    }

    fn parse_response(&self, raw: &Value) -> Result<ProviderReply> {
        let text = raw["text"].as_str().unwrap_or_default().to_owned();
        let function_calls = raw["calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        FunctionCall::new(
                            c["id"].as_str().unwrap_or_default(),
                            c["name"].as_str().unwrap_or_default(),
                            c["arguments"].clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ProviderReply {
            text,
            function_calls,
            model: raw["model"].as_str().map(str::to_owned),
        })
    }

    fn parse_stream_frame(&self, frame: &str, _state: &mut FrameState) -> Result<Vec<FrameEvent>> {
        let v: Value = serde_json::from_str(frame).map_err(|e| EngineError::ProviderParse {
            reason: format!("bad stub frame: {e}"),
        })?;
        let index = v["index"].as_u64().unwrap_or_default() as u32;
        let s = |key: &str| v[key].as_str().unwrap_or_default().to_owned();
        let event = match v["type"].as_str().unwrap_or_default() {
            "text" => FrameEvent::TextDelta(s("delta")),
            "reasoning" => FrameEvent::ReasoningDelta(s("delta")),
            "call_start" => FrameEvent::CallStart {
                index,
                id: s("id"),
                name: s("name"),
            },
            "args" => FrameEvent::CallArgumentsDelta {
                index,
                fragment: s("fragment"),
            },
            "block_end" => FrameEvent::BlockEnd { index },
            "model" => FrameEvent::Model(s("name")),
            "done" => FrameEvent::Done,
            "error" => FrameEvent::Failed(s("message")),
            _ => return Ok(Vec::new()),
        };
        Ok(vec![event])
    }
}

// ── Response builders ──────────────────────────────────────────────────

pub fn reply_text(text: &str) -> Value {
    json!({"text": text, "model": "stub-1"})
}

pub fn reply_calls(text: &str, calls: &[(&str, &str, Value)]) -> Value {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| json!({"id": id, "name": name, "arguments": args}))
        .collect();
    json!({"text": text, "calls": calls, "model": "stub-1"})
}

pub fn text_frames(chunks: &[&str]) -> Vec<String> {
    let mut frames = vec![json!({"type": "model", "name": "stub-1"}).to_string()];
    frames.extend(
        chunks
            .iter()
            .map(|c| json!({"type": "text", "delta": c}).to_string()),
    );
    frames.push(json!({"type": "done"}).to_string());
    frames
}

/// Frames for one function call whose arguments arrive in two fragments.
pub fn call_frames(index: u32, id: &str, name: &str, args: &Value) -> Vec<String> {
    let args = args.to_string();
    let (a, b) = args.split_at(args.len() / 2);
    vec![
        json!({"type": "call_start", "index": index, "id": id, "name": name}).to_string(),
        json!({"type": "args", "index": index, "fragment": a}).to_string(),
        json!({"type": "args", "index": index, "fragment": b}).to_string(),
        json!({"type": "block_end", "index": index}).to_string(),
    ]
}

pub fn done_frame() -> String {
    json!({"type": "done"}).to_string()
}

// ═══════════════════════════════════════════════════════════════════════
//  Scripted transport
// ═══════════════════════════════════════════════════════════════════════

pub enum Scripted {
    /// A complete response body.
    Reply(Value),
    /// A complete response body delivered after a pause.
    SlowReply(Value, Duration),
    /// Frames of a streamed response.
    Frames(Vec<String>),
    /// Frames delivered with a pause before each one.
    SlowFrames(Vec<String>, Duration),
    /// A transport-level failure.
    Fail(String),
    /// A request that never answers.
    Hang,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Number of requests received (streamed or not).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &ProviderRequest) -> Option<Scripted> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<Value> {
        match self.next(request) {
            Some(Scripted::Reply(body)) => Ok(body),
            Some(Scripted::SlowReply(body, pause)) => {
                tokio::time::sleep(pause).await;
                Ok(body)
            }
            Some(Scripted::Fail(reason)) => Err(EngineError::Transport { reason }),
            Some(Scripted::Hang) => std::future::pending().await,
            Some(_) => Err(EngineError::Internal("scripted a stream for send".into())),
            None => Err(EngineError::Transport {
                reason: "script exhausted".into(),
            }),
        }
    }

    async fn open_stream(&self, request: &ProviderRequest) -> Result<FrameStream> {
        match self.next(request) {
            Some(Scripted::Frames(frames)) => {
                Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
            }
            Some(Scripted::SlowFrames(frames, pause)) => Ok(futures::stream::iter(frames)
                .then(move |frame| async move {
                    tokio::time::sleep(pause).await;
                    Ok(frame)
                })
                .boxed()),
            Some(Scripted::Fail(reason)) => Err(EngineError::Transport { reason }),
            Some(Scripted::Hang) => Ok(futures::stream::pending().boxed()),
            Some(Scripted::Reply(_) | Scripted::SlowReply(..)) => {
                Err(EngineError::Internal("scripted a reply for a stream".into()))
            }
            None => Err(EngineError::Transport {
                reason: "script exhausted".into(),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Function handlers
// ═══════════════════════════════════════════════════════════════════════

/// `get_weather(city)` -> "Sunny, 22C in <city>".
pub struct Weather;

#[async_trait]
impl FunctionHandler for Weather {
    fn definitions(&self) -> Vec<FunctionDefinition> {
        vec![FunctionDefinition {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }]
    }

    async fn call(&self, _name: &str, arguments: Value) -> Result<String> {
        let city = arguments["city"].as_str().unwrap_or("nowhere");
        Ok(format!("Sunny, 22C in {city}"))
    }
}

/// `slow` sleeps before answering, `fast` answers at once.
pub struct Latency;

#[async_trait]
impl FunctionHandler for Latency {
    fn definitions(&self) -> Vec<FunctionDefinition> {
        ["slow", "fast"]
            .into_iter()
            .map(|name| FunctionDefinition {
                name: name.into(),
                description: format!("{name} function"),
                parameters: json!({"type": "object"}),
            })
            .collect()
    }

    async fn call(&self, name: &str, _arguments: Value) -> Result<String> {
        if name == "slow" {
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        Ok(format!("{name} done"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

pub fn engine(transport: &Arc<ScriptedTransport>) -> Engine {
    engine_with_config(transport, EngineConfig::default())
}

pub fn engine_with_config(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> Engine {
    Engine::builder(Arc::new(StubAdapter), transport.clone())
        .function(Arc::new(Weather))
        .function(Arc::new(Latency))
        .config(config)
        .build()
        .unwrap()
}

pub fn rounds(max_rounds: u32) -> FunctionCallingPolicy {
    FunctionCallingPolicy::default()
        .with_max_rounds(max_rounds)
        .with_logging(false)
}
