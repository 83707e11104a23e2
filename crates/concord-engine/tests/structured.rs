//! Integration tests for structured output and its repair loop.

mod common;

use serde::Deserialize;

use concord_engine::{CallOptions, EngineConfig, EngineError, StructuredOutputPolicy};
use schemars::JsonSchema;

use common::{Scripted, ScriptedTransport, engine, engine_with_config, reply_text};

#[derive(Debug, Deserialize, JsonSchema, PartialEq)]
struct Forecast {
    city: String,
    celsius: i32,
}

fn valid() -> Scripted {
    Scripted::Reply(reply_text(r#"{"city": "Lima", "celsius": 19}"#))
}

fn invalid(text: &str) -> Scripted {
    Scripted::Reply(reply_text(text))
}

fn repairs(n: u32) -> StructuredOutputPolicy {
    StructuredOutputPolicy::with_max_repair_attempts(n)
}

#[tokio::test]
async fn valid_first_output_needs_no_repair() {
    let transport = ScriptedTransport::new([valid()]);
    let engine = engine(&transport);

    let forecast: Forecast = engine
        .complete_structured(&engine.conversation(), "Lima?", &CallOptions::new(), repairs(2))
        .await
        .unwrap();

    assert_eq!(forecast.city, "Lima");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn fenced_output_is_extracted() {
    let transport = ScriptedTransport::new([invalid(
        "Here is the forecast:\n```json\n{\"city\": \"Lima\", \"celsius\": 19}\n```",
    )]);
    let engine = engine(&transport);

    let forecast: Forecast = engine
        .complete_structured(&engine.conversation(), "Lima?", &CallOptions::new(), repairs(0))
        .await
        .unwrap();

    assert_eq!(forecast.celsius, 19);
}

#[tokio::test]
async fn bracketed_citation_does_not_hide_payload() {
    let transport = ScriptedTransport::new([invalid(
        r#"Source [1]: {"city": "Lima", "celsius": 19}"#,
    )]);
    let engine = engine(&transport);

    let forecast: Forecast = engine
        .complete_structured(&engine.conversation(), "Lima?", &CallOptions::new(), repairs(0))
        .await
        .unwrap();

    assert_eq!(forecast.celsius, 19);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn zero_repairs_fails_after_one_attempt() {
    let transport = ScriptedTransport::new([invalid("not json"), valid()]);
    let engine = engine(&transport);

    let err = engine
        .complete_structured::<Forecast>(
            &engine.conversation(),
            "Lima?",
            &CallOptions::new(),
            repairs(0),
        )
        .await
        .unwrap_err();

    let diag = match err {
        EngineError::StructuredOutputFailure(diag) => diag,
        other => panic!("expected StructuredOutputFailure, got {other:?}"),
    };
    assert_eq!(diag.attempts, 1);
    assert_eq!(diag.shape_name, "Forecast");
    assert_eq!(diag.first_raw, "not json");
    assert_eq!(diag.last_raw, "not json");
    assert!(!diag.last_error.is_empty());
    assert!(diag.schema["properties"].get("celsius").is_some());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn two_repairs_succeed_on_third_attempt() {
    let transport = ScriptedTransport::new([
        invalid("cold and sunny"),
        invalid(r#"{"city": "Lima"}"#),
        valid(),
    ]);
    let engine = engine(&transport);
    let conv = engine.conversation();

    let forecast: Forecast = engine
        .complete_structured(&conv, "Lima?", &CallOptions::new(), repairs(2))
        .await
        .unwrap();

    assert_eq!(
        forecast,
        Forecast {
            city: "Lima".into(),
            celsius: 19
        }
    );
    assert_eq!(transport.calls(), 3);

    // Repair rounds run on a scratch conversation without functions.
    assert_eq!(conv.len(), 2);
    let requests = transport.requests();
    for repair in &requests[1..] {
        assert_eq!(repair.body["functions"], serde_json::json!([]));
        assert!(!repair.stream);
    }
    let second_repair = requests[2].body["messages"].as_array().unwrap();
    let prompt = second_repair.last().unwrap()["content"].as_str().unwrap();
    assert!(prompt.contains(r#"{"city": "Lima"}"#));
    assert!(prompt.contains("celsius"));
}

#[tokio::test]
async fn exhausted_repairs_report_first_and_last_output() {
    let transport = ScriptedTransport::new([invalid("first try"), invalid("second try")]);
    let engine = engine(&transport);

    let err = engine
        .complete_structured::<Forecast>(
            &engine.conversation(),
            "Lima?",
            &CallOptions::new(),
            repairs(1),
        )
        .await
        .unwrap_err();

    let diag = match err {
        EngineError::StructuredOutputFailure(diag) => diag,
        other => panic!("expected StructuredOutputFailure, got {other:?}"),
    };
    assert_eq!(diag.attempts, 2);
    assert_eq!(diag.first_raw, "first try");
    assert_eq!(diag.last_raw, "second try");
}

#[tokio::test]
async fn transport_failure_during_repair_propagates() {
    let transport = ScriptedTransport::new([
        invalid("garbage"),
        Scripted::Fail("connection reset".into()),
    ]);
    let engine = engine(&transport);

    let err = engine
        .complete_structured::<Forecast>(
            &engine.conversation(),
            "Lima?",
            &CallOptions::new(),
            repairs(3),
        )
        .await
        .unwrap_err();

    assert!(err.is_transport(), "got {err:?}");
}

#[tokio::test]
async fn repair_bound_defaults_to_service_config() {
    let transport = ScriptedTransport::new([invalid("nope"), valid()]);
    let config = EngineConfig {
        max_repair_attempts: 1,
        ..EngineConfig::default()
    };
    let engine = engine_with_config(&transport, config);

    let forecast: Forecast = engine
        .complete_structured(
            &engine.conversation(),
            "Lima?",
            &CallOptions::new(),
            StructuredOutputPolicy::default(),
        )
        .await
        .unwrap();

    assert_eq!(forecast.city, "Lima");
    assert_eq!(transport.calls(), 2);
}
