// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for defining sets and subsets of MQTT client functionality.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::control_packet::{Event, Publish, PublishProperties, QoS};
use crate::error::{AckError, ConnectionError, DisconnectError, PublishError, SubscribeError};
use crate::topic::{TopicParseError, Topology};

// ---------- Lower level MQTT abstractions ----------

/// MQTT publish and subscribe functionality
#[async_trait]
pub trait MqttPubSub {
    /// MQTT Publish
    ///
    /// If connection is unavailable, publish will be queued and delivered when connection is re-established.
    /// Blocks if at capacity for queueing.
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<(), PublishError>;

    /// MQTT Subscribe
    ///
    /// If connection is unavailable, subscribe will be queued and delivered when connection is re-established.
    /// Blocks if at capacity for queueing.
    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError>;
}

/// Provides functionality for acknowledging a received Publish message (QoS 1)
#[async_trait]
pub trait MqttAck {
    /// Acknowledge a received Publish.
    async fn ack(&self, publish: &Publish) -> Result<(), AckError>;
}

/// MQTT disconnect functionality
#[async_trait]
pub trait MqttDisconnect {
    /// Disconnect from the MQTT broker.
    async fn disconnect(&self) -> Result<(), DisconnectError>;
}

/// MQTT Event Loop manipulation
#[async_trait]
pub trait MqttEventLoop {
    /// Poll the event loop for the next [`Event`]
    async fn poll(&mut self) -> Result<Event, ConnectionError>;
}

// ---------- Higher level MQTT abstractions ----------

/// Acknowledgement owed for a received publish.
///
/// Consuming the token is the only way to acknowledge, so a delivery cannot be acked twice.
/// When one publish is dispatched to several receivers, the broker is only acknowledged
/// once every receiver has consumed its token.
#[must_use = "the broker will redeliver the publish if it is never acknowledged"]
pub struct AckToken {
    shared: Arc<SharedAck>,
}

struct SharedAck {
    publish: Publish,
    remaining: AtomicUsize,
    acker: Arc<dyn MqttAck + Send + Sync>,
}

impl AckToken {
    /// Create `count` tokens that together acknowledge `publish` through `acker`.
    pub(crate) fn split(
        publish: Publish,
        acker: Arc<dyn MqttAck + Send + Sync>,
        count: usize,
    ) -> Vec<AckToken> {
        let shared = Arc::new(SharedAck {
            publish,
            remaining: AtomicUsize::new(count),
            acker,
        });
        (0..count)
            .map(|_| AckToken {
                shared: shared.clone(),
            })
            .collect()
    }

    /// Packet identifier of the publish this token acknowledges
    #[must_use]
    pub fn pkid(&self) -> u16 {
        self.shared.publish.pkid
    }

    /// Acknowledge the publish.
    ///
    /// # Errors
    /// Returns [`AckError`] if the acknowledgement could not be handed to the connection.
    pub async fn ack(self) -> Result<(), AckError> {
        if self.shared.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }
        if self.shared.publish.qos == QoS::AtMostOnce {
            return Ok(());
        }
        self.shared.acker.ack(&self.shared.publish).await
    }
}

/// Functionality for receiving an MQTT publish
#[async_trait]
pub trait PubReceiver {
    /// Receives the next incoming publish along with the [`AckToken`] that acknowledges it.
    ///
    /// Return None if there will be no more incoming publishes.
    async fn recv(&mut self) -> Option<(Publish, AckToken)>;
}

/// An MQTT client whose connection is managed by a session.
#[async_trait]
pub trait ManagedClient: MqttPubSub {
    /// The type of receiver used by this client
    type PubReceiver: PubReceiver + Send + Sync;

    /// Get the client id for the MQTT connection
    fn client_id(&self) -> &str;

    /// Get the virtual namespace of the MQTT connection
    fn namespace(&self) -> &str;

    /// Exclusive reply destination for this client
    ///
    /// # Errors
    /// Returns [`TopicParseError`] if the client id cannot be used as a topic level.
    fn reply_topic(&self) -> Result<String, TopicParseError> {
        Ok(crate::topic::reply_topic(self.namespace(), self.client_id())?.to_string())
    }

    /// Creates a new [`PubReceiver`] that receives messages on a specific topic filter
    ///
    /// # Errors
    /// Returns a [`TopicParseError`] if the pub receiver cannot be registered.
    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<Self::PubReceiver, TopicParseError>;

    /// Subscribe to a topic filter and remember it, so it is restored whenever the broker
    /// reports that it lost the session state.
    ///
    /// Declaring a filter again with the same QoS sends nothing. A different QoS subscribes again.
    ///
    /// # Errors
    /// Returns [`SubscribeError`] if the subscribe could not be sent.
    async fn declare_filter(&self, topic_filter: &str, qos: QoS) -> Result<(), SubscribeError>;

    /// Declare the durable queue described by `topology` and its binding.
    ///
    /// # Errors
    /// Returns [`SubscribeError`] if the subscribe could not be sent.
    async fn declare_topology(&self, topology: &Topology) -> Result<(), SubscribeError> {
        self.declare_filter(topology.queue_filter().as_str(), QoS::AtLeastOnce)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct CountingAcker {
        acked: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl MqttAck for CountingAcker {
        async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
            self.acked.lock().unwrap().push(publish.pkid);
            Ok(())
        }
    }

    fn publish(qos: QoS, pkid: u16) -> Publish {
        let mut publish = Publish::new(
            "rabbit_exchange/reniec_operation",
            qos,
            "{}",
            PublishProperties::default(),
        );
        publish.pkid = pkid;
        publish
    }

    #[tokio::test]
    async fn single_token_acks() {
        let acker = Arc::new(CountingAcker::default());
        let mut tokens = AckToken::split(publish(QoS::AtLeastOnce, 7), acker.clone(), 1);
        let token = tokens.pop().unwrap();
        assert_eq!(token.pkid(), 7);
        token.ack().await.unwrap();
        assert_eq!(*acker.acked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn split_tokens_ack_once_after_all_consumed() {
        let acker = Arc::new(CountingAcker::default());
        let mut tokens = AckToken::split(publish(QoS::AtLeastOnce, 3), acker.clone(), 3);
        tokens.pop().unwrap().ack().await.unwrap();
        tokens.pop().unwrap().ack().await.unwrap();
        assert!(acker.acked.lock().unwrap().is_empty());
        tokens.pop().unwrap().ack().await.unwrap();
        assert_eq!(*acker.acked.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn qos0_never_reaches_broker() {
        let acker = Arc::new(CountingAcker::default());
        let mut tokens = AckToken::split(publish(QoS::AtMostOnce, 0), acker.clone(), 1);
        tokens.pop().unwrap().ack().await.unwrap();
        assert!(acker.acked.lock().unwrap().is_empty());
    }
}
