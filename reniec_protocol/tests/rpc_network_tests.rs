// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{env, time::Duration};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use reniec_mqtt::session::{Session, SessionOptionsBuilder};
use reniec_mqtt::MqttConnectionSettingsBuilder;
use reniec_protocol::lookup::{HealthMonitor, InMemoryLookup};
use reniec_protocol::rpc::responder::{ResponderOptionsBuilder, RpcResponder};
use reniec_protocol::rpc::router::{CorrelationRouter, CorrelationRouterOptionsBuilder};

// These tests need a broker configured through the BROKER_* environment variables

fn setup_test(client_id: &str) -> Result<Session, ()> {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .try_init();
    if env::var("ENABLE_NETWORK_TESTS").is_err() {
        log::warn!("This test is skipped. Set ENABLE_NETWORK_TESTS to run.");
        return Err(());
    }

    let connection_settings = MqttConnectionSettingsBuilder::from_environment()
        .unwrap()
        .client_id(client_id)
        .keep_alive(Duration::from_secs(5))
        .clean_start(true)
        .session_expiry(Duration::ZERO)
        .build()
        .unwrap();
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()
        .unwrap();
    Ok(Session::new(session_options).unwrap())
}

#[tokio::test]
async fn lookup_round_trip() {
    let Ok(mut server_session) = setup_test("network_test_reniec_server") else {
        // Network tests disabled, skipping tests
        return;
    };
    let Ok(mut client_session) = setup_test("network_test_load_client") else {
        return;
    };
    let server_exit = server_session.create_exit_handle();
    let client_exit = client_session.create_exit_handle();

    let options = ResponderOptionsBuilder::default()
        .queue("network_test_reniec_queue")
        .routing_key("network_test_reniec")
        .build()
        .unwrap();
    let mut responder = RpcResponder::new(
        server_session.create_managed_client(),
        InMemoryLookup::seeded(),
        HealthMonitor::default(),
        &options,
    )
    .unwrap();
    let router = CorrelationRouter::new(
        client_session.create_managed_client(),
        &CorrelationRouterOptionsBuilder::default()
            .routing_key("network_test_reniec")
            .build()
            .unwrap(),
    )
    .unwrap();

    let test_task = tokio::task::spawn(async move {
        let shutdown = CancellationToken::new();
        responder.start().await.unwrap();
        let responder_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { responder.run(shutdown).await }
        });
        // Give the broker a moment to register the shared subscription
        tokio::time::sleep(Duration::from_millis(500)).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            router.call(json!({"dni": "12345678"}).to_string(), &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.response["data"]["nombres"], "LUIS ALBERTO");

        shutdown.cancel();
        responder_task.await.unwrap().unwrap();
        router.shutdown().await;
        server_exit.try_exit().await.unwrap();
        client_exit.try_exit().await.unwrap();
    });

    assert!(tokio::try_join!(
        async move { test_task.await.map_err(|e| e.to_string()) },
        async move { server_session.run().await.map_err(|e| e.to_string()) },
        async move { client_session.run().await.map_err(|e| e.to_string()) },
    )
    .is_ok());
}
