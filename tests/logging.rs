//! Diagnostics emitted through the `log` facade.
//!
//! The captured log is global, so these tests run serially and hold the
//! [`LoggerHandle`] for their whole duration.

use std::time::Duration;

use log::Level;
use rstest::rstest;
use serde_json::json;
use serial_test::serial;
use unisoc::{Config, EndpointOptions, Engine, codec::decode_frame};
use unisoc_testing::{LoggerHandle, eventually, logger, mock_engine};

const WAIT: Duration = Duration::from_secs(5);

#[rstest]
#[serial]
#[tokio::test]
async fn response_to_unknown_request_is_logged(mut logger: LoggerHandle) {
    let (engine, link) = mock_engine(Engine::new(Config::default()));
    let stray = decode_frame(r#"{"__unisoc":true,"subject":"__unisoc_response","id":77,"data":1}"#)
        .expect("valid frame");
    engine.receive(stray);
    assert!(logger.contains(Level::Warn, &["non-existent request 77"]));
    assert!(link.sent().is_empty());
}

#[rstest]
#[serial]
#[tokio::test]
async fn unrouted_request_is_logged_and_answered(mut logger: LoggerHandle) {
    let (engine, link) = mock_engine(Engine::new(Config::default()));
    let request = decode_frame(r#"{"__unisoc":true,"subject":"nowhere","id":3}"#).expect("valid frame");
    engine.receive(request);
    assert!(eventually(WAIT, || !link.sent().is_empty()).await);
    let response = link.sent().remove(0);
    assert_eq!(response.id, 3);
    assert_eq!(response.error, Some(json!("404 Not Found")));
    assert!(logger.contains(Level::Warn, &["no endpoint or listener", "subject=nowhere"]));
}

#[rstest]
#[serial]
#[tokio::test]
async fn second_response_is_refused_with_a_warning(mut logger: LoggerHandle) {
    let engine = Engine::new(Config::default());
    engine
        .register_endpoint("twice", EndpointOptions::new().with_responder(), |call| async move {
            if let Some(responder) = call.responder() {
                responder.ok(json!(1)).await;
                assert!(!responder.ok(json!(2)).await);
            }
            Ok(serde_json::Value::Null)
        })
        .expect("register");
    assert_eq!(engine.call_endpoint("twice", ()).await.expect("first wins"), json!(1));
    assert!(eventually(WAIT, || logger.contains(Level::Warn, &["response already sent"])).await);
}

#[rstest]
#[serial]
#[tokio::test]
async fn kill_before_connect_is_reported(mut logger: LoggerHandle) {
    let engine = Engine::builder().name("idle").build();
    engine.kill().await;
    assert!(logger.contains(Level::Info, &["kill requested before connecting", "engine=idle"]));
}
