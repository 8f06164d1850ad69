// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use reniec_mqtt::control_packet::{Publish, QoS};
use reniec_mqtt::error::SubscribeError;
use reniec_mqtt::interface::{AckToken, ManagedClient, MqttPubSub, PubReceiver};
use reniec_mqtt::topic::{TopicParseError, Topology};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::envelope::{request_key, Envelope, LookupData, LookupResponse, RequestKey};
use crate::lookup::{HealthMonitor, Lookup, LookupError};
use crate::rpc::{parsed_from_environment, string_from_environment};

/// Error running an [`RpcResponder`]
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The exchange, queue or routing key cannot be used as a topic level
    #[error("invalid topology: {0}")]
    Topology(#[from] TopicParseError),
    /// The lookup collaborator could not be prepared
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// The request queue could not be declared
    #[error("could not declare request queue: {0}")]
    Declare(#[from] SubscribeError),
    /// The broker connection will deliver no more requests
    #[error("request receiver closed")]
    ReceiverClosed,
    /// The operation is not allowed in the current state
    #[error("invalid responder state: {0:?}")]
    InvalidState(ResponderState),
}

/// Lifecycle of an [`RpcResponder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// Created, nothing prepared yet
    Disconnected,
    /// Lookup prepared and queue declared, waiting for requests
    Ready,
    /// Handling a request
    Consuming,
    /// Releasing resources
    Closing,
    /// Done. Cannot be restarted.
    Stopped,
}

/// Options for an [`RpcResponder`]
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into))]
pub struct ResponderOptions {
    /// Exchange requests are published to
    #[builder(default = "\"rabbit_exchange\".to_string()")]
    exchange: String,
    /// Durable queue consumed by the responder
    #[builder(default = "\"reniec_queue\".to_string()")]
    queue: String,
    /// Routing key binding the queue to the exchange
    #[builder(default = "\"reniec_operation\".to_string()")]
    routing_key: String,
    /// Max unacknowledged requests in flight
    #[builder(default = "8")]
    prefetch: u16,
}

impl ResponderOptions {
    /// Max unacknowledged requests in flight. Applied as the receive maximum of the connection.
    #[must_use]
    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }
}

impl ResponderOptionsBuilder {
    /// Initialize the [`ResponderOptionsBuilder`] from `RENIEC_EXCHANGE`, `RENIEC_QUEUE`,
    /// `RENIEC_ROUTING` and `RENIEC_PREFETCH`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let mut builder = Self::default();
        builder.exchange = string_from_environment("RENIEC_EXCHANGE")?;
        builder.queue = string_from_environment("RENIEC_QUEUE")?;
        builder.routing_key = string_from_environment("RENIEC_ROUTING")?;
        builder.prefetch = parsed_from_environment("RENIEC_PREFETCH")?;
        Ok(builder)
    }
}

/// Consumes DNI lookup requests from the request queue and replies to each caller.
///
/// Requests are handled one at a time. Every delivery is acknowledged exactly once,
/// whether or not a reply could be sent.
pub struct RpcResponder<C, L>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
    L: Lookup,
{
    mqtt_client: C,
    lookup: L,
    health: HealthMonitor,
    topology: Topology,
    receiver: Option<C::PubReceiver>,
    state: ResponderState,
}

impl<C, L> RpcResponder<C, L>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
    L: Lookup,
{
    /// Create a new [`RpcResponder`].
    ///
    /// # Errors
    /// [`ResponderError::Topology`] if the exchange, queue or routing key is not a single
    /// plain topic level.
    pub fn new(
        mqtt_client: C,
        lookup: L,
        health: HealthMonitor,
        options: &ResponderOptions,
    ) -> Result<Self, ResponderError> {
        let topology = Topology::new(
            mqtt_client.namespace(),
            &options.exchange,
            &options.queue,
            &options.routing_key,
        )?;
        Ok(Self {
            mqtt_client,
            lookup,
            health,
            topology,
            receiver: None,
            state: ResponderState::Disconnected,
        })
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// Topology the responder consumes from
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Prepare the lookup collaborator and declare the request queue.
    ///
    /// # Errors
    /// - [`ResponderError::Lookup`] if the lookup prerequisites could not be satisfied
    /// - [`ResponderError::Declare`] if the request queue could not be declared
    /// - [`ResponderError::InvalidState`] if the responder was already started
    pub async fn start(&mut self) -> Result<(), ResponderError> {
        if self.state != ResponderState::Disconnected {
            return Err(ResponderError::InvalidState(self.state));
        }
        self.lookup.prepare().await?;
        // Register before subscribing so no delivery is missed
        let receiver = self
            .mqtt_client
            .create_filtered_pub_receiver(self.topology.queue_filter().as_str())?;
        self.receiver = Some(receiver);
        self.mqtt_client.declare_topology(&self.topology).await?;
        log::info!(
            "[reniec] Ready ex={} rk={} q={}",
            self.topology.exchange(),
            self.topology.routing_key(),
            self.topology.queue()
        );
        self.state = ResponderState::Ready;
        Ok(())
    }

    /// Consume requests until `shutdown` is cancelled, then close.
    ///
    /// Starts the responder first if needed. Failures handling a single request never end
    /// the loop.
    ///
    /// # Errors
    /// Any error from [`RpcResponder::start`], or [`ResponderError::ReceiverClosed`] if the
    /// broker connection ended before `shutdown` was cancelled. Resources are closed in
    /// either case.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ResponderError> {
        if self.state == ResponderState::Disconnected {
            if let Err(e) = self.start().await {
                self.close().await;
                return Err(e);
            }
        }
        let Some(mut receiver) = self.receiver.take() else {
            return Err(ResponderError::InvalidState(self.state));
        };
        log::info!("[reniec] Listening for requests");

        let result = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    log::info!("[reniec] Shutdown requested");
                    break Ok(());
                }
                recv_result = receiver.recv() => {
                    let Some((publish, ack_token)) = recv_result else {
                        log::error!("[reniec] Request receiver closed");
                        break Err(ResponderError::ReceiverClosed);
                    };
                    self.state = ResponderState::Consuming;
                    self.handle_request(&publish, ack_token).await;
                    self.check_lookup_health().await;
                    self.state = ResponderState::Ready;
                }
            }
        };
        drop(receiver);
        self.close().await;
        result
    }

    /// Handle one delivery: reply if possible, then acknowledge.
    async fn handle_request(&mut self, publish: &Publish, ack_token: AckToken) {
        let request = Envelope::from_publish(publish);
        log::debug!(
            "[reniec] Received corr={:?} reply_to={:?} size={}",
            request.correlation_token,
            request.reply_destination,
            request.body.len()
        );

        let response = self.respond(&request).await;
        match &request.reply_destination {
            None => log::warn!(
                "[reniec] Missing reply destination, dropping response corr={:?}",
                request.correlation_token
            ),
            Some(reply_destination) => match response.to_body() {
                Ok(body) => {
                    let size = body.len();
                    let reply = Envelope::reply_to(&request, body);
                    match self
                        .mqtt_client
                        .publish(
                            reply_destination.clone(),
                            QoS::AtLeastOnce,
                            reply.body.clone(),
                            reply.to_properties(),
                        )
                        .await
                    {
                        Ok(()) => log::debug!(
                            "[reniec] Sent corr={:?} to={reply_destination} size={size}",
                            request.correlation_token
                        ),
                        // Not retried, the caller sees no reply
                        Err(e) => log::error!(
                            "[reniec] Reply to {reply_destination} failed corr={:?}: {e}",
                            request.correlation_token
                        ),
                    }
                }
                Err(e) => log::error!("[reniec] Could not encode response: {e}"),
            },
        }

        if let Err(e) = ack_token.ack().await {
            log::error!("[reniec] Error acking request: {e}");
        }
    }

    /// Build the response body for a request.
    async fn respond(&mut self, request: &Envelope) -> LookupResponse {
        let dni = match request_key(&request.body) {
            RequestKey::Valid(dni) => dni,
            RequestKey::Invalid(normalized) => {
                return LookupResponse::success(LookupData::miss(normalized))
            }
            RequestKey::Missing => return LookupResponse::success(LookupData::miss(String::new())),
        };
        match self.lookup.lookup(&dni).await {
            Ok(Some(record)) => LookupResponse::success(LookupData::hit(record.dni, record.details)),
            Ok(None) => LookupResponse::success(LookupData::miss(dni)),
            Err(e) => {
                log::warn!("[reniec] Lookup of {dni} failed: {e}");
                LookupResponse::failure(e.to_string())
            }
        }
    }

    async fn check_lookup_health(&mut self) {
        self.health.check(&mut self.lookup).await;
    }

    /// Release the request receiver and the lookup connection. Each is released independently.
    pub async fn close(&mut self) {
        if self.state == ResponderState::Stopped {
            return;
        }
        self.state = ResponderState::Closing;
        self.receiver = None;
        if let Err(e) = self.lookup.close().await {
            log::warn!("[reniec] Error closing lookup: {e}");
        }
        self.state = ResponderState::Stopped;
        log::info!("[reniec] Stopped cleanly");
    }
}
