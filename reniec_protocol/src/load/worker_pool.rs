// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs the load scenario on independent workers that share one [`Metrics`].

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reniec_mqtt::interface::{MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub};
use reniec_mqtt::session::{Session, SessionManagedClient};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::load::metrics::{Metrics, MetricsSnapshot};
use crate::load::scenario::{
    create_loan_body, deposit_body, register_body, registration_ids, OperationKind,
    ScenarioOptions, DEPOSIT_AMOUNTS, LOAN_PRINCIPALS,
};
use crate::rpc::router::{CallOutcome, CorrelationRouter, CorrelationRouterOptions};

/// Time a worker waits for its session to disconnect at the end of the run
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns the workers of a load run, each with its own session and [`CorrelationRouter`].
pub struct WorkerPool {
    scenario: ScenarioOptions,
    router: CorrelationRouterOptions,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    /// Create a pool for `scenario`, calling through routers configured with `router`.
    #[must_use]
    pub fn new(scenario: ScenarioOptions, router: CorrelationRouterOptions) -> Self {
        Self {
            scenario,
            router,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Metrics shared by the workers
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run every worker to completion, or until `stop` is cancelled, and reduce the metrics.
    ///
    /// `connect` creates the session of worker `w`. A worker whose session cannot be created
    /// or fails to connect is logged and runs no scenario; the other workers are unaffected.
    pub async fn run<C, EL, F>(&self, connect: F, stop: CancellationToken) -> MetricsSnapshot
    where
        C: MqttPubSub + MqttAck + MqttDisconnect + Clone + Send + Sync + 'static,
        EL: MqttEventLoop + Send + 'static,
        F: Fn(usize) -> Result<Session<C, EL>, Box<dyn Error + Send + Sync>>,
    {
        log::info!(
            "[pool] workers={} clients/worker={} tx/client={} loans/client={}",
            self.scenario.workers(),
            self.scenario.clients_per_worker(),
            self.scenario.tx_per_client(),
            self.scenario.loans_per_client()
        );
        let (seed_base, seed_count) = self.scenario.seed_range();
        log::info!(
            "[pool] seed base={seed_base} count={seed_count} fixed={}",
            self.scenario.use_fixed_dnis()
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.scenario.workers() {
            let session = match connect(worker_id) {
                Ok(session) => session,
                Err(e) => {
                    log::error!("[worker {worker_id}] Could not create session: {e}");
                    continue;
                }
            };
            workers.spawn(run_worker(
                worker_id,
                session,
                self.scenario.clone(),
                self.router.clone(),
                self.metrics.clone(),
                stop.child_token(),
            ));
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                log::error!("[pool] Worker task failed: {e}");
            }
        }
        self.metrics.snapshot()
    }
}

/// Drive one worker: run its session, play the scenario, then disconnect.
async fn run_worker<C, EL>(
    worker_id: usize,
    mut session: Session<C, EL>,
    scenario: ScenarioOptions,
    router_options: CorrelationRouterOptions,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
) where
    C: MqttPubSub + MqttAck + MqttDisconnect + Clone + Send + Sync + 'static,
    EL: MqttEventLoop + Send + 'static,
{
    let exit_handle = session.create_exit_handle();
    let managed_client = session.create_managed_client();
    let session_monitor = tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(e) = session.run().await {
                log::error!("[worker {worker_id}] Session ended: {e}");
            }
            // Calls waiting on a dead session would otherwise never return
            stop.cancel();
        }
    });

    match CorrelationRouter::new(managed_client, &router_options) {
        Ok(router) => {
            run_scenario(worker_id, &router, &scenario, &metrics, &stop).await;
            router.shutdown().await;
        }
        Err(e) => log::error!("[worker {worker_id}] Could not create router: {e}"),
    }

    if !session_monitor.is_finished() {
        match exit_handle.try_exit_timeout(EXIT_TIMEOUT).await {
            Ok(()) => {}
            Err(e) => {
                log::warn!("[worker {worker_id}] Graceful exit failed: {e}");
                exit_handle.exit_force().await;
            }
        }
    }
    if let Err(e) = session_monitor.await {
        log::error!("[worker {worker_id}] Session task failed: {e}");
    }
    log::debug!("[worker {worker_id}] Done");
}

/// Register each simulated client, then issue its deposits and loans.
async fn run_scenario<C>(
    worker_id: usize,
    router: &CorrelationRouter<SessionManagedClient<C>>,
    scenario: &ScenarioOptions,
    metrics: &Metrics,
    stop: &CancellationToken,
) where
    C: MqttPubSub + Clone + Send + Sync + 'static,
{
    for client in 0..scenario.clients_per_worker() {
        if stop.is_cancelled() {
            log::info!("[worker {worker_id}] Stopped after {client} clients");
            break;
        }

        let dni = scenario.pick_dni(worker_id, client);
        let outcome = call(worker_id, router, &register_body(&dni, 0.0), stop).await;
        metrics.record(OperationKind::Register.as_str(), outcome.ok, outcome.elapsed);
        if !outcome.ok {
            continue;
        }
        let Some((client_id, account_id)) = registration_ids(&outcome.response) else {
            metrics.record(OperationKind::RegisterParse.as_str(), false, Duration::ZERO);
            continue;
        };

        for _ in 0..scenario.tx_per_client() {
            let amount = DEPOSIT_AMOUNTS[rand::thread_rng().gen_range(0..DEPOSIT_AMOUNTS.len())];
            let outcome = call(worker_id, router, &deposit_body(&account_id, amount), stop).await;
            metrics.record(OperationKind::Deposit.as_str(), outcome.ok, outcome.elapsed);
        }
        for _ in 0..scenario.loans_per_client() {
            let principal =
                LOAN_PRINCIPALS[rand::thread_rng().gen_range(0..LOAN_PRINCIPALS.len())];
            let body = create_loan_body(&client_id, &account_id, principal);
            let outcome = call(worker_id, router, &body, stop).await;
            metrics.record(OperationKind::CreateLoan.as_str(), outcome.ok, outcome.elapsed);
        }
    }
}

/// Make one call, counting a failure to call as an unsuccessful outcome.
async fn call<C>(
    worker_id: usize,
    router: &CorrelationRouter<SessionManagedClient<C>>,
    body: &Value,
    stop: &CancellationToken,
) -> CallOutcome
where
    C: MqttPubSub + Clone + Send + Sync + 'static,
{
    let body = Bytes::from(body.to_string());
    match router.call(body, stop).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("[worker {worker_id}] Call failed: {e}");
            CallOutcome::abandoned()
        }
    }
}
