// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Answers DNI lookup requests from the `personas` table of a Postgres database.

use std::error::Error;
use std::time::Duration;

use reniec_mqtt::session::{Session, SessionOptionsBuilder};
use reniec_mqtt::MqttConnectionSettingsBuilder;
use reniec_protocol::lookup::HealthMonitor;
use reniec_protocol::rpc::responder::{ResponderOptionsBuilder, RpcResponder};
use tokio_util::sync::CancellationToken;

use crate::postgres_lookup::{PostgresLookup, PostgresLookupOptionsBuilder};

mod postgres_lookup;

#[macro_use]
extern crate derive_builder;

const DEFAULT_CLIENT_ID: &str = "reniec-server";
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let responder_options = ResponderOptionsBuilder::from_environment()?.build()?;
    let lookup_options = PostgresLookupOptionsBuilder::from_environment()?.build()?;

    // The request queue outlives the connection, and the broker holds back deliveries
    // beyond the prefetch until they are acknowledged
    let connection_settings = MqttConnectionSettingsBuilder::from_environment()?
        .default_client_id(DEFAULT_CLIENT_ID)
        .receive_max(responder_options.prefetch())
        .build()?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()?;
    let mut session = Session::new(session_options)?;

    let mut responder = RpcResponder::new(
        session.create_managed_client(),
        PostgresLookup::new(lookup_options),
        HealthMonitor::default(),
        &responder_options,
    )?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let exit_handle = session.create_exit_handle();
    let responder_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = responder.run(shutdown).await;
            if let Err(e) = exit_handle.try_exit_timeout(EXIT_TIMEOUT).await {
                log::warn!("[reniec] Graceful session exit failed: {e}");
                exit_handle.exit_force().await;
            }
            result
        }
    });

    let session_result = session.run().await;
    // Nothing more will be delivered once the session has ended
    shutdown.cancel();
    let responder_result = responder_task.await?;

    session_result?;
    responder_result?;
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("[reniec] SIGINT received"),
                    _ = sigterm.recv() => log::info!("[reniec] SIGTERM received"),
                }
            }
            Err(e) => {
                log::warn!("[reniec] Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                log::info!("[reniec] SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("[reniec] SIGINT received");
    }
    shutdown.cancel();
}
