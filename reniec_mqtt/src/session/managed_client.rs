// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Internal implementation of [`SessionManagedClient`] and [`SessionPubReceiver`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::control_packet::{Publish, PublishProperties, QoS};
use crate::error::{PublishError, SubscribeError};
use crate::interface::{AckToken, ManagedClient, MqttPubSub, PubReceiver};
use crate::session::dispatcher::{DispatchItem, IncomingPublishDispatcher};
use crate::topic::{TopicFilter, TopicParseError};

/// Topic filters declared on a session, restored whenever the broker loses the session state.
pub(crate) type DeclaredFilters = Arc<Mutex<BTreeMap<String, QoS>>>;

/// An MQTT client that has its connection state externally managed by a [`Session`](super::Session).
/// Can be used to send messages and create receivers for incoming messages.
#[derive(Clone)]
pub struct SessionManagedClient<PS = crate::rumqttc_adapter::ClientAlias>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    /// Client ID of the `Session` that manages this client
    pub(crate) client_id: String,
    /// Virtual namespace of the `Session`
    pub(crate) namespace: String,
    /// PubSub for sending outgoing MQTT messages
    pub(crate) pub_sub: PS,
    /// Dispatcher for incoming publishes
    pub(crate) incoming_pub_dispatcher: Arc<Mutex<IncomingPublishDispatcher>>,
    /// Filters to restore on a new broker session
    pub(crate) declared_filters: DeclaredFilters,
}

#[async_trait]
impl<PS> ManagedClient for SessionManagedClient<PS>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    type PubReceiver = SessionPubReceiver;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<SessionPubReceiver, TopicParseError> {
        let topic_filter = TopicFilter::from_str(topic_filter)?;
        let pub_rx = self
            .incoming_pub_dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register_filter(&topic_filter);
        Ok(SessionPubReceiver { pub_rx })
    }

    async fn declare_filter(&self, topic_filter: &str, qos: QoS) -> Result<(), SubscribeError> {
        if !TopicFilter::is_valid_topic_filter(topic_filter) {
            return Err(SubscribeError::InvalidTopicFilter);
        }
        let previous = self
            .declared_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic_filter.to_string(), qos);
        if previous == Some(qos) {
            log::debug!("[{}] {topic_filter} already declared", self.client_id);
            return Ok(());
        }
        let result = self.pub_sub.subscribe(topic_filter, qos).await;
        if result.is_err() {
            // Leave the filter undeclared so a later declaration tries again
            let mut declared = self
                .declared_filters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match previous {
                Some(previous) => declared.insert(topic_filter.to_string(), previous),
                None => declared.remove(topic_filter),
            };
        }
        result
    }
}

#[async_trait]
impl<PS> MqttPubSub for SessionManagedClient<PS>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<(), PublishError> {
        self.pub_sub.publish(topic, qos, payload, properties).await
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError> {
        self.pub_sub.subscribe(topic, qos).await
    }
}

/// Receive incoming MQTT messages along with the token to acknowledge them.
pub struct SessionPubReceiver {
    /// Receiver for incoming publishes
    pub_rx: UnboundedReceiver<DispatchItem>,
}

impl SessionPubReceiver {
    /// Stop accepting new publishes. Publishes already dispatched can still be received.
    pub fn close(&mut self) {
        self.pub_rx.close();
    }
}

#[async_trait]
impl PubReceiver for SessionPubReceiver {
    async fn recv(&mut self) -> Option<(Publish, AckToken)> {
        self.pub_rx.recv().await
    }
}
