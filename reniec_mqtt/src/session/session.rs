// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of [`Session`] and [`SessionExitHandle`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::control_packet::{Event, Publish};
use crate::error::ConnectionError;
use crate::interface::{AckToken, MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub};
use crate::rumqttc_adapter as adapter;
use crate::session::dispatcher::{DispatchError, IncomingPublishDispatcher};
use crate::session::managed_client::{DeclaredFilters, SessionManagedClient};
use crate::session::reconnect_policy::ReconnectPolicy;
use crate::session::state::SessionState;
use crate::session::{SessionError, SessionErrorKind, SessionExitError, SessionOptions};

/// Client that manages connections over a single MQTT session.
///
/// Use this centrally in an application to control the session and to create
/// instances of [`SessionManagedClient`] and [`SessionExitHandle`].
pub struct Session<C = adapter::ClientAlias, EL = adapter::EventLoopAlias>
where
    C: MqttPubSub + MqttAck + MqttDisconnect + Clone + Send + Sync + 'static,
    EL: MqttEventLoop,
{
    /// Underlying MQTT client
    client: C,
    /// Underlying MQTT event loop
    event_loop: EL,
    /// Client ID of the connection
    client_id: String,
    /// Virtual namespace of the connection
    namespace: String,
    /// Dispatcher for incoming publishes
    incoming_pub_dispatcher: Arc<Mutex<IncomingPublishDispatcher>>,
    /// Filters to restore when the broker did not keep the session
    declared_filters: DeclaredFilters,
    /// Reconnect policy
    reconnect_policy: Box<dyn ReconnectPolicy + Send + Sync>,
    /// Current state
    state: Arc<SessionState>,
    /// Notifier for a force exit signal
    notify_force_exit: Arc<Notify>,
}

impl Session {
    /// Create a new [`Session`] with the provided options structure.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if there are errors using the session options.
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let client_id = options.connection_settings.client_id().to_string();
        let namespace = options.connection_settings.namespace().to_string();
        let (client, event_loop) =
            adapter::client(options.connection_settings, options.outgoing_max)
                .map_err(SessionErrorKind::from)?;
        Ok(Session::new_from_injection(
            client,
            event_loop,
            options.reconnect_policy,
            client_id,
            namespace,
        ))
    }
}

impl<C, EL> Session<C, EL>
where
    C: MqttPubSub + MqttAck + MqttDisconnect + Clone + Send + Sync + 'static,
    EL: MqttEventLoop,
{
    /// Create a [`Session`] over an already constructed client and event loop.
    pub fn new_from_injection(
        client: C,
        event_loop: EL,
        reconnect_policy: Box<dyn ReconnectPolicy + Send + Sync>,
        client_id: String,
        namespace: String,
    ) -> Self {
        Self {
            client,
            event_loop,
            client_id,
            namespace,
            incoming_pub_dispatcher: Arc::new(Mutex::new(IncomingPublishDispatcher::default())),
            declared_filters: DeclaredFilters::default(),
            reconnect_policy,
            state: Arc::new(SessionState::default()),
            notify_force_exit: Arc::new(Notify::new()),
        }
    }

    /// Return a new instance of [`SessionExitHandle`] that can be used to end this [`Session`]
    pub fn create_exit_handle(&self) -> SessionExitHandle<C> {
        SessionExitHandle {
            disconnector: self.client.clone(),
            state: self.state.clone(),
            force_exit: self.notify_force_exit.clone(),
        }
    }

    /// Return a new instance of [`SessionManagedClient`] that can be used to send and receive messages
    pub fn create_managed_client(&self) -> SessionManagedClient<C> {
        SessionManagedClient {
            client_id: self.client_id.clone(),
            namespace: self.namespace.clone(),
            pub_sub: self.client.clone(),
            incoming_pub_dispatcher: self.incoming_pub_dispatcher.clone(),
            declared_filters: self.declared_filters.clone(),
        }
    }

    /// Begin running the [`Session`].
    ///
    /// Blocks until either a session exit or a fatal connection error is encountered.
    /// Failing to establish the very first connection is fatal. Once connected, lost
    /// connections are re-established according to the reconnect policy.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the session encounters a fatal error and ends.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        if !self.state.start() {
            log::error!("[{}] Session re-use is not supported", self.client_id);
            return Err(SessionErrorKind::InvalidState(
                "Session re-use is not supported".to_string(),
            )
            .into());
        }

        let acker: Arc<dyn MqttAck + Send + Sync> = Arc::new(self.client.clone());
        // Number of previous reconnect attempts
        let mut prev_reconnect_attempts = 0;
        // Return value for the session indicating reason for exit
        let mut result = Ok(());

        loop {
            let next = tokio::select! {
                // Ensure that the force exit signal is checked first.
                biased;
                () = self.notify_force_exit.notified() => { break },
                next = self.event_loop.poll() => { next },
            };

            match next {
                Ok(Event::ConnAck(connack)) => {
                    let reconnected = self.state.connection_count() > 0;
                    self.state.transition_connected();
                    prev_reconnect_attempts = 0;
                    log::debug!("[{}] Incoming CONNACK: {connack:?}", self.client_id);
                    if reconnected && !connack.session_present {
                        log::warn!(
                            "[{}] Session state not present on broker after reconnect. Restoring declared filters.",
                            self.client_id
                        );
                        self.restore_declared_filters();
                    }
                }
                Ok(Event::Publish(publish)) => {
                    log::debug!(
                        "[{}] Incoming PUB on {} (pkid {})",
                        self.client_id,
                        publish.topic,
                        publish.pkid
                    );
                    let dispatch_result = self
                        .incoming_pub_dispatcher
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .dispatch_publish(publish, &acker);
                    match dispatch_result {
                        Ok(dispatched) => {
                            log::debug!("Dispatched PUB to {} receivers", dispatched.receivers);
                            for token in dispatched.orphaned {
                                tokio::spawn(ack_orphaned(token));
                            }
                        }
                        Err(DispatchError::Unmatched(publish) | DispatchError::InvalidTopic(publish, _)) => {
                            log::warn!(
                                "[{}] No receiver for PUB on {}. Will auto-ack.",
                                self.client_id,
                                publish.topic
                            );
                            // Ack in a task to avoid blocking the event loop
                            tokio::spawn(auto_ack(self.client.clone(), publish));
                        }
                    }
                }
                Ok(Event::Other) => {}

                // Desired disconnect completion. Exiting also marks the Session disconnected.
                Err(_) if self.state.exit_requested() => {
                    log::info!(
                        "[{}] Disconnected due to user-initiated Session exit",
                        self.client_id
                    );
                    break;
                }

                // Connection refused by broker - unrecoverable
                Err(ConnectionError::ConnectionRefused(rc)) => {
                    log::error!("[{}] Connection Refused: rc: {rc}", self.client_id);
                    result = Err(SessionErrorKind::ConnectionError(
                        ConnectionError::ConnectionRefused(rc),
                    ));
                    break;
                }

                // Never connected
                Err(e) if self.state.connection_count() == 0 => {
                    log::error!("[{}] Initial connection failed: {e}", self.client_id);
                    result = Err(SessionErrorKind::InitialConnectionFailed(e));
                    break;
                }

                // Other errors are passed to reconnect policy
                Err(e) => {
                    self.state.transition_disconnected();
                    log::error!("[{}] Error: {e:?}", self.client_id);

                    if let Some(delay) = self
                        .reconnect_policy
                        .next_reconnect_delay(prev_reconnect_attempts, &e)
                    {
                        log::info!("[{}] Attempting reconnect in {delay:?}", self.client_id);
                        // Wait for either the reconnect delay time, or a force exit signal
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.notify_force_exit.notified() => {
                                log::info!("[{}] Reconnect attempts halted by force exit", self.client_id);
                                result = Err(SessionErrorKind::ForceExit);
                                break;
                            }
                        }
                    } else {
                        log::info!(
                            "[{}] Reconnect attempts halted by reconnect policy",
                            self.client_id
                        );
                        result = Err(SessionErrorKind::ReconnectHalted);
                        break;
                    }
                    prev_reconnect_attempts += 1;
                }
            }
        }
        self.state.transition_exited();
        result.map_err(std::convert::Into::into)
    }

    /// Re-issue the subscribes for every declared filter in a background task.
    fn restore_declared_filters(&self) {
        let filters: Vec<_> = self
            .declared_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        let client = self.client.clone();
        let client_id = self.client_id.clone();
        // Subscribe requests are queued until the event loop is polled again
        tokio::spawn(async move {
            for (filter, qos) in filters {
                match client.subscribe(filter.clone(), qos).await {
                    Ok(()) => log::info!("[{client_id}] Restored subscription to {filter}"),
                    Err(e) => {
                        log::error!("[{client_id}] Could not restore subscription to {filter}: {e}");
                    }
                }
            }
        });
    }
}

async fn auto_ack(acker: impl MqttAck, publish: Publish) {
    match acker.ack(&publish).await {
        Ok(()) => log::debug!("Auto-ack successful"),
        Err(e) => log::error!("Auto-ack failed. Publish may be redelivered. Reason: {e:?}"),
    }
}

async fn ack_orphaned(token: AckToken) {
    let pkid = token.pkid();
    if let Err(e) = token.ack().await {
        log::error!("Ack for closed receiver failed for PKID {pkid}: {e:?}");
    }
}

/// Handle used to end an MQTT session.
#[derive(Clone)]
pub struct SessionExitHandle<D = adapter::ClientAlias>
where
    D: MqttDisconnect + Clone + Send + Sync,
{
    /// The disconnector used to issue disconnect requests
    disconnector: D,
    /// Session state information
    state: Arc<SessionState>,
    /// Notifier for force exit
    force_exit: Arc<Notify>,
}

impl<D> SessionExitHandle<D>
where
    D: MqttDisconnect + Clone + Send + Sync,
{
    /// Attempt to gracefully end the MQTT session running in the [`Session`] that created this handle.
    /// This will cause the [`Session::run()`] method to return.
    ///
    /// Note that a graceful exit requires the [`Session`] to be connected to the broker.
    /// If the [`Session`] connection has been recently lost, the [`Session`] may not yet realize this,
    /// and it can take until up to the keep-alive interval for the [`Session`] to realize it is disconnected.
    ///
    /// # Errors
    /// * [`SessionExitError::Dropped`] if the Session no longer exists.
    /// * [`SessionExitError::BrokerUnavailable`] if the Session is not connected to the broker.
    pub async fn try_exit(&self) -> Result<(), SessionExitError> {
        log::debug!("Attempting to exit session gracefully");
        if !self.state.is_connected() {
            return Err(SessionExitError::BrokerUnavailable { attempted: false });
        }
        self.trigger_exit_user().await?;
        tokio::select! {
            biased;
            () = self.state.condition_exited() => Ok(()),
            () = self.state.condition_disconnected() => Err(SessionExitError::BrokerUnavailable{attempted: true})
        }
    }

    /// Same as [`SessionExitHandle::try_exit`], giving up after `timeout`.
    ///
    /// # Errors
    /// * [`SessionExitError::Dropped`] if the Session no longer exists.
    /// * [`SessionExitError::BrokerUnavailable`] if the Session is not connected to the broker.
    /// * [`SessionExitError::Timeout`] if the graceful exit attempt does not complete within the specified timeout.
    pub async fn try_exit_timeout(&self, timeout: Duration) -> Result<(), SessionExitError> {
        tokio::time::timeout(timeout, self.try_exit()).await?
    }

    /// Forcefully end the MQTT session running in the [`Session`] that created this handle.
    /// This will cause the [`Session::run()`] method to return.
    ///
    /// The [`Session`] will be granted a period of 1 second to attempt a graceful exit before
    /// forcing the exit. If the exit is forced, the broker will not be aware the MQTT session
    /// has ended.
    ///
    /// Returns true if the exit was graceful, and false if the exit was forced.
    pub async fn exit_force(&self) -> bool {
        log::debug!("Attempting to exit session gracefully before force exiting");
        // Ignore the result here - we don't care
        let _ = self.trigger_exit_user().await;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                log::debug!("Grace period for graceful session exit expired. Force exiting session");
                // NOTE: There is only one waiter on this Notify at any time.
                self.force_exit.notify_one();
                false
            },
            () = self.state.condition_exited() => {
                log::debug!("Session exited gracefully without need for force exit");
                true
            }
        }
    }

    /// Trigger a session exit, specifying the end user as the issuer of the request
    async fn trigger_exit_user(&self) -> Result<(), SessionExitError> {
        self.state.request_exit();
        Ok(self.disconnector.disconnect().await?)
    }
}
