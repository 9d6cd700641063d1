//! Configuration pushes delivered to a running agent over the bus

mod helpers;

use std::time::Duration;
use tokio::sync::oneshot;

use helpers::AgentHarness;
use tokenwatch::bus::{MessageBus, OutboundMessage};
use tokenwatch::constants::{CONFIG_QUEUE, EVENT_QUEUE};
use tokenwatch::control;
use tokenwatch::daemon::config::AgentConfiguration;

#[tokio::test]
async fn test_running_agent_applies_valid_push_and_rejects_malformed() {
    let mut h = AgentHarness::new();
    let inbound = h.bus.subscribe(CONFIG_QUEUE).await.unwrap();
    let bus = h.bus.clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let operator = async move {
        control::push_config(bus.as_ref(), b"{ not json".to_vec()).await.unwrap();
        control::push_config(bus.as_ref(), br#"{"reloadTime": "2h"}"#.to_vec()).await.unwrap();
        // A text message on the shared queue is not a configuration push
        bus.publish(EVENT_QUEUE, OutboundMessage::text("hello")).await.unwrap();
        control::push_config(
            bus.as_ref(),
            br#"{"reloadTime": "250ms", "possibleVendors": ["a89", "20a0"]}"#.to_vec(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop_tx.send(());
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let (result, ()) = tokio::join!(h.agent.run(inbound, shutdown), operator);
    result.unwrap();

    let config = h.agent.config();
    assert_eq!(config.reload_time, Duration::from_millis(250));
    assert!(config.possible_vendors.contains("0A89"));
    assert!(config.possible_vendors.contains("20A0"));
    assert!(!config.possible_vendors.contains("1050"));
    // Fields absent from the push keep their values
    assert!(!config.token_driver.is_empty());

    let persisted = AgentConfiguration::load_from_file(&h.dir.path().join("config.json")).unwrap();
    assert_eq!(&persisted, config);
}

#[tokio::test]
async fn test_agent_stops_on_shutdown_without_pushes() {
    let mut h = AgentHarness::new();
    let inbound = h.bus.subscribe(CONFIG_QUEUE).await.unwrap();

    let shutdown = tokio::time::sleep(Duration::from_millis(50));
    h.agent.run(inbound, shutdown).await.unwrap();

    assert_eq!(h.agent.config().reload_time, Duration::from_secs(10));
}

#[tokio::test]
async fn test_run_ends_with_error_when_publish_fails() {
    let mut h = AgentHarness::new();
    h.enumerator.set_devices(vec![helpers::device(0x0a89, 0x0030, 4)]);
    h.driver.set_tokens(helpers::RUTOKEN_LIBRARY, vec![helpers::FakeToken::new("ABC123", &[])]);
    h.bus.set_failing(true);
    let inbound = h.bus.subscribe(CONFIG_QUEUE).await.unwrap();

    // The first tick fires immediately and its publish fails
    let result = h.agent.run(inbound, std::future::pending::<()>()).await;

    assert!(result.is_err());
}
