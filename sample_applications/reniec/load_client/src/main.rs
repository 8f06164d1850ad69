// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives the bank registration scenario from many concurrent clients and reports latencies.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use reniec_mqtt::session::{Session, SessionOptionsBuilder};
use reniec_mqtt::MqttConnectionSettingsBuilder;
use reniec_protocol::load::scenario::ScenarioOptionsBuilder;
use reniec_protocol::load::worker_pool::WorkerPool;
use reniec_protocol::rpc::router::CorrelationRouterOptionsBuilder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod report;

/// Settings of the process itself, outside the scenario
#[derive(Debug, Default, PartialEq)]
struct RunSettings {
    /// Where to write the CSV report
    csv_path: Option<PathBuf>,
    /// Raise the stop signal after this long
    run_timeout: Option<Duration>,
}

impl RunSettings {
    /// Read `CSV_PATH` and `LOAD_RUN_TIMEOUT` (seconds).
    fn from_environment() -> Result<Self, String> {
        let csv_path = env::var("CSV_PATH")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let run_timeout = env::var("LOAD_RUN_TIMEOUT")
            .ok()
            .map(|secs| {
                secs.parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| format!("LOAD_RUN_TIMEOUT: {e}"))
            })
            .transpose()?;
        Ok(Self {
            csv_path,
            run_timeout,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let scenario = ScenarioOptionsBuilder::from_environment()?.build()?;
    let router_options = CorrelationRouterOptionsBuilder::from_environment()?.build()?;
    let settings = RunSettings::from_environment()?;
    let connection_settings = MqttConnectionSettingsBuilder::from_environment()?;

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("[load] SIGINT received, stopping");
                stop.cancel();
            }
        }
    });
    if let Some(run_timeout) = settings.run_timeout {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(run_timeout).await;
            log::info!("[load] Run timeout of {}s elapsed, stopping", run_timeout.as_secs());
            stop.cancel();
        });
    }

    let pool = WorkerPool::new(scenario, router_options);
    let snapshot = pool
        .run(
            |worker_id| {
                // Replies go to a destination only this run uses, so nothing is kept
                // after disconnecting
                let connection_settings = connection_settings
                    .clone()
                    .client_id(worker_client_id(worker_id))
                    .clean_start(true)
                    .session_expiry(Duration::ZERO)
                    .build()?;
                let session_options = SessionOptionsBuilder::default()
                    .connection_settings(connection_settings)
                    .build()?;
                Ok(Session::new(session_options)?)
            },
            stop,
        )
        .await;

    report::publish(&snapshot, settings.csv_path.as_deref())?;
    Ok(())
}

/// `load-client-{worker_id}-` followed by random hex characters
fn worker_client_id(worker_id: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("load-client-{worker_id}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_environment() {
        temp_env::with_vars_unset(["CSV_PATH", "LOAD_RUN_TIMEOUT"], || {
            assert_eq!(RunSettings::from_environment().unwrap(), RunSettings::default());
        });
    }

    #[test]
    fn set_environment() {
        temp_env::with_vars(
            [
                ("CSV_PATH", Some("load.csv")),
                ("LOAD_RUN_TIMEOUT", Some("90")),
            ],
            || {
                let settings = RunSettings::from_environment().unwrap();
                assert_eq!(settings.csv_path, Some(PathBuf::from("load.csv")));
                assert_eq!(settings.run_timeout, Some(Duration::from_secs(90)));
            },
        );
    }

    #[test]
    fn empty_csv_path_is_unset() {
        temp_env::with_vars([("CSV_PATH", Some("")), ("LOAD_RUN_TIMEOUT", None)], || {
            assert_eq!(RunSettings::from_environment().unwrap().csv_path, None);
        });
    }

    #[test]
    fn invalid_timeout() {
        temp_env::with_var("LOAD_RUN_TIMEOUT", Some("soon"), || {
            assert!(RunSettings::from_environment().is_err());
        });
    }

    #[test]
    fn worker_client_ids_are_unique() {
        let first = worker_client_id(3);
        let second = worker_client_id(3);
        assert!(first.starts_with("load-client-3-"));
        assert_eq!(first.len(), "load-client-3-".len() + 8);
        assert_ne!(first, second);
    }
}
