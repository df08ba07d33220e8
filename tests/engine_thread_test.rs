//! The engine side calling in from its own OS thread, outside the tokio runtime.

mod common;

use beamline_workflow::config::WorkflowConfig;
use beamline_workflow::connection::{ConnectionState, RunOutcome};
use beamline_workflow::protocol::{MessageType, Payload, RequestConfiguration};
use common::Harness;

#[tokio::test]
async fn blocking_calls_from_an_engine_thread() {
    let harness = Harness::start(WorkflowConfig::default()).await;
    let channel = harness.channel.clone();

    let engine_thread = std::thread::spawn(move || {
        let configuration = channel.call_blocking(
            Payload::RequestConfiguration(RequestConfiguration),
            "e1",
            Some("c1"),
        );
        let ready = channel.call_blocking(Payload::PrepareForCentring, "e1", Some("c2"));
        let completed = channel.call_blocking(Payload::WorkflowCompleted, "e1", None);
        (configuration, ready, completed)
    });
    let (configuration, ready, completed) = tokio::task::spawn_blocking(move || engine_thread.join())
        .await
        .unwrap()
        .unwrap();

    let Some(Payload::ConfigurationData(data)) = configuration else {
        panic!("expected ConfigurationData, got {configuration:?}");
    };
    assert_eq!(data.location, "/config/gphl");
    assert_eq!(ready, Some(Payload::ReadyForCentring));
    assert_eq!(completed, None);
    assert_eq!(
        harness.observations.types(),
        [MessageType::RequestConfiguration, MessageType::PrepareForCentring]
    );

    let channel = harness.channel.clone();
    let (connection, outcome) = harness.finish().await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    assert_eq!(connection.state(), ConnectionState::Off);

    // Once the loop has finished, a blocking call is answered with an abort instead of hanging
    let late_thread = std::thread::spawn(move || {
        channel.call_blocking(Payload::PrepareForCentring, "e1", Some("c3"))
    });
    let late = tokio::task::spawn_blocking(move || late_thread.join())
        .await
        .unwrap()
        .unwrap();
    assert!(late.unwrap().is_abort());
}
