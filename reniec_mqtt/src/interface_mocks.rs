// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bespoke mocks for relevant traits defined in the interface module.
//!
//! [`MockClient`] and [`MockEventLoop`] can be used standalone, with events injected by hand
//! through an [`EventInjector`], or attached to a [`MockBroker`] that routes publishes between
//! all of its connections the way a broker would.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{error::SendError, unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::control_packet::{ConnAck, Event, Publish, PublishProperties, QoS};
use crate::error::{AckError, ConnectionError, DisconnectError, PublishError, SubscribeError};
use crate::interface::{MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub};
use crate::topic::{TopicFilter, TopicName};

/// Mock implementation of an MQTT client.
///
/// A client created with [`MockClient::new`] succeeds on all operations and delivers nothing.
/// A client created with [`MockBroker::connect`] routes its operations through the broker.
#[derive(Clone)]
pub struct MockClient {
    attached: Option<(String, MockBroker)>,
}

impl MockClient {
    /// Return a new mocked MQTT client that is not attached to a broker.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { attached: None }
    }
}

#[async_trait]
impl MqttPubSub for MockClient {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<(), PublishError> {
        let topic = topic.into();
        if !TopicName::is_valid_topic_name(&topic) {
            return Err(PublishError::InvalidTopicName);
        }
        match &self.attached {
            Some((client_id, broker)) => {
                broker.route_publish(client_id, Publish::new(topic, qos, payload, properties))
            }
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError> {
        let topic = topic.into();
        let Ok(topic_filter) = TopicFilter::from_str(&topic) else {
            return Err(SubscribeError::InvalidTopicFilter);
        };
        if let Some((client_id, broker)) = &self.attached {
            broker.add_subscription(client_id, topic_filter, qos);
        }
        Ok(())
    }
}

#[async_trait]
impl MqttAck for MockClient {
    async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
        if let Some((client_id, broker)) = &self.attached {
            broker.lock().acks.push((client_id.clone(), publish.pkid));
        }
        Ok(())
    }
}

#[async_trait]
impl MqttDisconnect for MockClient {
    async fn disconnect(&self) -> Result<(), DisconnectError> {
        if let Some((client_id, broker)) = &self.attached {
            broker.disconnect(client_id);
        }
        Ok(())
    }
}

/// Mock implementation of an MQTT event loop
pub struct MockEventLoop {
    rx: UnboundedReceiver<Result<Event, ConnectionError>>,
}

impl MockEventLoop {
    /// Return a new mocked MQTT event loop along with an event injector.
    #[must_use]
    pub fn new() -> (Self, EventInjector) {
        let (tx, rx) = unbounded_channel();
        (Self { rx }, EventInjector { tx })
    }
}

#[async_trait]
impl MqttEventLoop for MockEventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        match self.rx.recv().await {
            Some(next) => next,
            None => Err(ConnectionError::RequestsDone),
        }
    }
}

/// Used to inject events into the [`MockEventLoop`].
#[derive(Clone)]
pub struct EventInjector {
    tx: UnboundedSender<Result<Event, ConnectionError>>,
}

impl EventInjector {
    /// Inject an event into the [`MockEventLoop`].
    ///
    /// # Errors
    /// Returns a [`SendError`] if the event could not be injected
    /// (i.e. the event loop has been dropped).
    pub fn inject(&self, event: Event) -> Result<(), SendError<Result<Event, ConnectionError>>> {
        self.tx.send(Ok(event))
    }

    /// Inject a connection error into the [`MockEventLoop`].
    ///
    /// # Errors
    /// Returns a [`SendError`] if the error could not be injected
    /// (i.e. the event loop has been dropped).
    pub fn inject_error(
        &self,
        error: ConnectionError,
    ) -> Result<(), SendError<Result<Event, ConnectionError>>> {
        self.tx.send(Err(error))
    }
}

/// In-process stand-in for a broker.
///
/// Publishes are routed to every connection with a matching subscription. Shared subscriptions
/// with the same share name and filter form a group, and each publish goes to one member of
/// the group in turn. Every operation is recorded for later inspection.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<String, MockConnection>,
    /// Next group member per (share name, filter)
    share_cursors: HashMap<(String, String), usize>,
    next_pkid: u16,
    fail_publishes: usize,
    publishes: Vec<(String, Publish)>,
    subscribes: Vec<(String, String)>,
    acks: Vec<(String, u16)>,
    disconnects: Vec<String>,
}

struct MockConnection {
    injector: EventInjector,
    subscriptions: Vec<(TopicFilter, QoS)>,
    /// Order of connection, used to keep shared subscription groups in a stable order
    order: usize,
}

impl MockBroker {
    /// Create a new broker without connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection for `client_id`.
    ///
    /// The returned event loop starts with a CONNACK without session state.
    #[must_use]
    pub fn connect(&self, client_id: &str) -> (MockClient, MockEventLoop) {
        let (event_loop, injector) = MockEventLoop::new();
        // The receiving half is held by `event_loop`, so this cannot fail
        let _ = injector.inject(Event::ConnAck(ConnAck {
            session_present: false,
        }));
        let mut state = self.lock();
        let order = state.connections.len();
        state.connections.insert(
            client_id.to_string(),
            MockConnection {
                injector,
                subscriptions: vec![],
                order,
            },
        );
        drop(state);
        (
            MockClient {
                attached: Some((client_id.to_string(), self.clone())),
            },
            event_loop,
        )
    }

    /// Sever the connection of `client_id` and let it reconnect.
    ///
    /// When `session_present` is false, the broker forgets the subscriptions of the connection,
    /// as it would after the session expired.
    pub fn sever(&self, client_id: &str, session_present: bool) {
        let mut state = self.lock();
        if let Some(connection) = state.connections.get_mut(client_id) {
            if !session_present {
                connection.subscriptions.clear();
            }
            let _ = connection.injector.inject_error(ConnectionError::Network(
                "connection reset by peer".to_string(),
            ));
            let _ = connection
                .injector
                .inject(Event::ConnAck(ConnAck { session_present }));
        }
    }

    /// Fail the next `count` publishes from any connection.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    /// Publishes received by the broker, with the client id of the sender
    #[must_use]
    pub fn publishes(&self) -> Vec<(String, Publish)> {
        self.lock().publishes.clone()
    }

    /// Subscribes received by the broker, with the client id of the subscriber
    #[must_use]
    pub fn subscribes(&self) -> Vec<(String, String)> {
        self.lock().subscribes.clone()
    }

    /// Number of distinct active subscriptions of `client_id`
    #[must_use]
    pub fn subscription_count(&self, client_id: &str) -> usize {
        self.lock()
            .connections
            .get(client_id)
            .map_or(0, |c| c.subscriptions.len())
    }

    /// Acks received by the broker, with the client id that acked
    #[must_use]
    pub fn acks(&self) -> Vec<(String, u16)> {
        self.lock().acks.clone()
    }

    /// Client ids that disconnected
    #[must_use]
    pub fn disconnects(&self) -> Vec<String> {
        self.lock().disconnects.clone()
    }

    fn add_subscription(&self, client_id: &str, topic_filter: TopicFilter, qos: QoS) {
        let mut state = self.lock();
        state
            .subscribes
            .push((client_id.to_string(), topic_filter.to_string()));
        if let Some(connection) = state.connections.get_mut(client_id) {
            match connection
                .subscriptions
                .iter_mut()
                .find(|(existing, _)| *existing == topic_filter)
            {
                Some(existing) => existing.1 = qos,
                None => connection.subscriptions.push((topic_filter, qos)),
            }
        }
    }

    fn disconnect(&self, client_id: &str) {
        let mut state = self.lock();
        state.disconnects.push(client_id.to_string());
        if let Some(connection) = state.connections.remove(client_id) {
            let _ = connection
                .injector
                .inject_error(ConnectionError::Network("disconnected".to_string()));
        }
    }

    fn route_publish(&self, sender: &str, publish: Publish) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(PublishError::DetachedClient);
        }
        state.publishes.push((sender.to_string(), publish.clone()));
        let topic_name = TopicName::from_str(&publish.topic)
            .map_err(|_| PublishError::InvalidTopicName)?;

        let mut ordered: Vec<(&String, &MockConnection)> = state.connections.iter().collect();
        ordered.sort_by_key(|(_, c)| c.order);

        let mut targets: Vec<(String, QoS)> = vec![];
        let mut groups: HashMap<(String, String), Vec<(String, QoS)>> = HashMap::new();
        for (client_id, connection) in ordered {
            for (topic_filter, qos) in &connection.subscriptions {
                if !topic_filter.matches_topic_name(&topic_name) {
                    continue;
                }
                match topic_filter.share_name() {
                    Some(share_name) => groups
                        .entry((
                            share_name.to_string(),
                            topic_filter.matching_filter().to_string(),
                        ))
                        .or_default()
                        .push((client_id.clone(), *qos)),
                    None if !targets.iter().any(|(id, _)| id == client_id) => {
                        targets.push((client_id.clone(), *qos));
                    }
                    None => {}
                }
            }
        }
        for (group, members) in groups {
            let cursor = state.share_cursors.entry(group).or_insert(0);
            let member = members[*cursor % members.len()].clone();
            *cursor = cursor.wrapping_add(1);
            targets.push(member);
        }

        for (client_id, sub_qos) in targets {
            let qos = min_qos(publish.qos, sub_qos);
            let pkid = if qos == QoS::AtMostOnce {
                0
            } else {
                state.next_pkid = state.next_pkid.checked_add(1).unwrap_or(1);
                state.next_pkid
            };
            if let Some(connection) = state.connections.get(&client_id) {
                let mut delivery = publish.clone();
                delivery.qos = qos;
                delivery.pkid = pkid;
                let _ = connection.injector.inject(Event::Publish(delivery));
            }
        }
        Ok(())
    }
}

fn min_qos(a: QoS, b: QoS) -> QoS {
    fn level(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
    if level(a) <= level(b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_publish(event_loop: &mut MockEventLoop) -> Publish {
        loop {
            if let Ok(Event::Publish(publish)) = event_loop.poll().await {
                return publish;
            }
        }
    }

    #[tokio::test]
    async fn routes_to_subscriber() {
        let broker = MockBroker::new();
        let (publisher, _publisher_loop) = broker.connect("load-client-0");
        let (subscriber, mut subscriber_loop) = broker.connect("reniec-server");
        subscriber
            .subscribe("rabbit_exchange/reniec_operation", QoS::AtLeastOnce)
            .await
            .unwrap();
        publisher
            .publish(
                "rabbit_exchange/reniec_operation",
                QoS::AtLeastOnce,
                "{}",
                PublishProperties::default(),
            )
            .await
            .unwrap();

        let publish = next_publish(&mut subscriber_loop).await;
        assert_eq!(publish.topic, "rabbit_exchange/reniec_operation");
        assert_ne!(publish.pkid, 0);
        assert_eq!(broker.publishes().len(), 1);
    }

    #[tokio::test]
    async fn shared_subscription_round_robin() {
        let broker = MockBroker::new();
        let (publisher, _publisher_loop) = broker.connect("load-client-0");
        let (server1, mut loop1) = broker.connect("reniec-server-1");
        let (server2, mut loop2) = broker.connect("reniec-server-2");
        let filter = "$share/reniec_queue/rabbit_exchange/reniec_operation";
        server1.subscribe(filter, QoS::AtLeastOnce).await.unwrap();
        server2.subscribe(filter, QoS::AtLeastOnce).await.unwrap();

        for payload in ["first", "second"] {
            publisher
                .publish(
                    "rabbit_exchange/reniec_operation",
                    QoS::AtLeastOnce,
                    payload,
                    PublishProperties::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(next_publish(&mut loop1).await.payload, "first");
        assert_eq!(next_publish(&mut loop2).await.payload, "second");
    }

    #[tokio::test]
    async fn repeated_subscribe_is_one_subscription() {
        let broker = MockBroker::new();
        let (client, _event_loop) = broker.connect("reniec-server");
        client.subscribe("clients/+/reply", QoS::AtLeastOnce).await.unwrap();
        client.subscribe("clients/+/reply", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(broker.subscribes().len(), 2);
        assert_eq!(broker.subscription_count("reniec-server"), 1);
    }

    #[tokio::test]
    async fn publish_failure_injection() {
        let broker = MockBroker::new();
        let (client, _event_loop) = broker.connect("reniec-server");
        broker.fail_next_publishes(1);
        let properties = PublishProperties::default();
        assert!(client
            .publish("clients/a/reply", QoS::AtLeastOnce, "{}", properties.clone())
            .await
            .is_err());
        assert!(client
            .publish("clients/a/reply", QoS::AtLeastOnce, "{}", properties)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn disconnect_ends_event_loop() {
        let broker = MockBroker::new();
        let (client, mut event_loop) = broker.connect("reniec-server");
        assert!(matches!(event_loop.poll().await, Ok(Event::ConnAck(_))));
        client.disconnect().await.unwrap();
        assert!(event_loop.poll().await.is_err());
        assert_eq!(broker.disconnects(), vec!["reniec-server".to_string()]);
    }
}
