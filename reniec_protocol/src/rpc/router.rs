// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use reniec_mqtt::control_packet::QoS;
use reniec_mqtt::error::{PublishError, SubscribeError};
use reniec_mqtt::interface::{ManagedClient, MqttPubSub, PubReceiver};
use reniec_mqtt::topic::{publish_topic, TopicParseError};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::envelope::{decode_reply, reply_ok, Envelope};
use crate::rpc::string_from_environment;

/// Prefix of generated correlation tokens
const TOKEN_PREFIX: &str = "corr";
/// Number of hex characters following the prefix
const TOKEN_HEX_LEN: usize = 10;

/// Error making a call through a [`CorrelationRouter`]
#[derive(Debug, Error)]
pub enum RouterError {
    /// The request or reply topic is not valid
    #[error("invalid topic: {0}")]
    Topic(#[from] TopicParseError),
    /// The reply destination could not be subscribed
    #[error("could not subscribe to reply destination: {0}")]
    Subscribe(#[from] SubscribeError),
    /// The request could not be published
    #[error("could not publish request: {0}")]
    Publish(#[from] PublishError),
    /// No more replies will be received
    #[error("reply receiver closed")]
    ReceiverClosed,
    /// The router has been shut down
    #[error("router is shut down")]
    ShutDown,
}

/// Options for a [`CorrelationRouter`]
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into))]
pub struct CorrelationRouterOptions {
    /// Exchange requests are published to
    #[builder(default = "\"rabbit_exchange\".to_string()")]
    exchange: String,
    /// Routing key of the requests
    #[builder(default = "\"bank_operation\".to_string()")]
    routing_key: String,
}

impl CorrelationRouterOptionsBuilder {
    /// Initialize the [`CorrelationRouterOptionsBuilder`] from `LOAD_EXCHANGE` and `BANK_ROUTING`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let mut builder = Self::default();
        builder.exchange = string_from_environment("LOAD_EXCHANGE")?;
        builder.routing_key = string_from_environment("BANK_ROUTING")?;
        Ok(builder)
    }
}

/// Result of one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// The `ok` field of the reply
    pub ok: bool,
    /// Time from publishing the request to receiving the reply
    pub elapsed: Duration,
    /// Decoded reply body
    pub response: Value,
}

impl CallOutcome {
    /// A call abandoned before its reply arrived
    #[must_use]
    pub fn abandoned() -> Self {
        Self {
            ok: false,
            elapsed: Duration::ZERO,
            response: json!({}),
        }
    }
}

/// Waiters for outstanding calls, by correlation token
type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Bytes>>>>;

fn lock_pending(pending: &PendingCalls) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Bytes>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry of a call however the call ends.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    token: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Subscribed,
    Shutdown,
}

/// Routes replies from this client's exclusive reply destination back to the calls that
/// are waiting for them.
///
/// Each call is tagged with a fresh correlation token. A reply is delivered to the call
/// holding its token exactly once. Replies with unknown tokens are acknowledged and dropped.
pub struct CorrelationRouter<C>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    mqtt_client: C,
    client_id: String,
    request_topic: String,
    reply_topic: String,
    pending: PendingCalls,
    router_state_mutex: tokio::sync::Mutex<State>,
    shutdown_notifier: Arc<Notify>,
}

impl<C> CorrelationRouter<C>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    /// Create a new [`CorrelationRouter`] and start receiving on its reply destination.
    ///
    /// The reply destination is subscribed on the first call.
    ///
    /// # Errors
    /// [`RouterError::Topic`] if the request or reply topic cannot be built.
    pub fn new(mqtt_client: C, options: &CorrelationRouterOptions) -> Result<Self, RouterError> {
        let client_id = mqtt_client.client_id().to_string();
        let request_topic =
            publish_topic(mqtt_client.namespace(), &options.exchange, &options.routing_key)?
                .to_string();
        let reply_topic = mqtt_client.reply_topic()?;
        let receiver = mqtt_client.create_filtered_pub_receiver(&reply_topic)?;

        let pending = PendingCalls::default();
        let shutdown_notifier = Arc::new(Notify::new());
        tokio::spawn({
            let pending = pending.clone();
            let shutdown_notifier = shutdown_notifier.clone();
            let client_id = client_id.clone();
            async move {
                Self::receive_reply_loop(receiver, pending, shutdown_notifier, client_id).await;
            }
        });

        Ok(Self {
            mqtt_client,
            client_id,
            request_topic,
            reply_topic,
            pending,
            router_state_mutex: tokio::sync::Mutex::new(State::New),
            shutdown_notifier,
        })
    }

    /// Exclusive reply destination of this router
    #[must_use]
    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Number of calls waiting for a reply
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Publish `body` as a request and wait for its reply, or for `stop` to be cancelled.
    ///
    /// A cancelled call returns [`CallOutcome::abandoned`]; a reply arriving later is dropped.
    ///
    /// # Errors
    /// - [`RouterError::Subscribe`] if the reply destination could not be subscribed
    /// - [`RouterError::Publish`] if the request could not be published
    /// - [`RouterError::ReceiverClosed`] if replies stopped being received during the call
    /// - [`RouterError::ShutDown`] if the router has been shut down
    pub async fn call(
        &self,
        body: impl Into<Bytes>,
        stop: &CancellationToken,
    ) -> Result<CallOutcome, RouterError> {
        self.ensure_subscribed().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let token = self.register(reply_tx);
        let guard = PendingGuard {
            pending: &self.pending,
            token,
        };

        let request = Envelope::request(guard.token.clone(), self.reply_topic.clone(), body.into());
        let started = Instant::now();
        self.mqtt_client
            .publish(
                self.request_topic.clone(),
                QoS::AtLeastOnce,
                request.body.clone(),
                request.to_properties(),
            )
            .await?;

        tokio::select! {
            biased;
            () = stop.cancelled() => {
                log::debug!("[router {}] Call {} abandoned", self.client_id, guard.token);
                Ok(CallOutcome::abandoned())
            }
            reply = reply_rx => {
                let elapsed = started.elapsed();
                let body = reply.map_err(|_| RouterError::ReceiverClosed)?;
                let response = decode_reply(&body);
                Ok(CallOutcome {
                    ok: reply_ok(&response),
                    elapsed,
                    response,
                })
            }
        }
    }

    /// Insert a waiter under a token that is not outstanding, and return the token.
    fn register(&self, reply_tx: oneshot::Sender<Bytes>) -> String {
        let mut pending = lock_pending(&self.pending);
        loop {
            match pending.entry(new_correlation_token()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    let token = entry.key().clone();
                    entry.insert(reply_tx);
                    return token;
                }
            }
        }
    }

    async fn ensure_subscribed(&self) -> Result<(), RouterError> {
        let mut router_state = self.router_state_mutex.lock().await;
        match *router_state {
            State::New => {
                self.mqtt_client
                    .declare_filter(&self.reply_topic, QoS::AtLeastOnce)
                    .await?;
                log::debug!("[router {}] Subscribed to {}", self.client_id, self.reply_topic);
                *router_state = State::Subscribed;
                Ok(())
            }
            State::Subscribed => Ok(()),
            State::Shutdown => Err(RouterError::ShutDown),
        }
    }

    async fn receive_reply_loop(
        mut receiver: C::PubReceiver,
        pending: PendingCalls,
        shutdown_notifier: Arc<Notify>,
        client_id: String,
    ) {
        loop {
            tokio::select! {
                () = shutdown_notifier.notified() => {
                    log::info!("[router {client_id}] Reply receiver closed");
                    break;
                }
                recv_result = receiver.recv() => {
                    let Some((publish, ack_token)) = recv_result else {
                        log::info!("[router {client_id}] No more replies will be received");
                        break;
                    };
                    let reply = Envelope::from_publish(&publish);
                    let waiter = reply
                        .correlation_token
                        .as_ref()
                        .and_then(|token| lock_pending(&pending).remove(token));
                    match waiter {
                        Some(reply_tx) => {
                            if reply_tx.send(reply.body).is_err() {
                                log::debug!(
                                    "[router {client_id}] Caller gave up on {:?}",
                                    reply.correlation_token
                                );
                            }
                        }
                        None => log::debug!(
                            "[router {client_id}] Stale reply dropped corr={:?}",
                            reply.correlation_token
                        ),
                    }
                    if let Err(e) = ack_token.ack().await {
                        log::error!("[router {client_id}] Error acking reply: {e}");
                    }
                }
            }
        }
        // Wake every remaining caller
        lock_pending(&pending).clear();
    }

    /// Stop receiving replies. Outstanding and later calls fail.
    pub async fn shutdown(&self) {
        self.shutdown_notifier.notify_one();
        let mut router_state = self.router_state_mutex.lock().await;
        *router_state = State::Shutdown;
        log::info!("[router {}] Shutdown", self.client_id);
    }
}

impl<C> Drop for CorrelationRouter<C>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown_notifier.notify_one();
        log::debug!("[router {}] Router has been dropped", self.client_id);
    }
}

/// Generate `corr-` followed by lowercase hex characters.
#[must_use]
pub fn new_correlation_token() -> String {
    format!("{TOKEN_PREFIX}-{}", random_hex(TOKEN_HEX_LEN))
}

/// `len` random lowercase hex characters
pub(crate) fn random_hex(len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(HEX[rng.gen_range(0..HEX.len())]))
        .collect()
}
