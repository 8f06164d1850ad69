// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::control_packet::Publish;
use crate::interface::{AckToken, MqttAck};
use crate::topic::{TopicFilter, TopicName, TopicParseError};

pub type DispatchItem = (Publish, AckToken);

#[derive(Error, Debug)]
pub enum DispatchError {
    /// No registered receiver matches the topic of the publish
    #[error("no receiver registered for topic {}", .0.topic)]
    Unmatched(Publish),
    /// The publish was received on a topic that is not a valid topic name
    #[error("invalid topic on received publish: {1}")]
    InvalidTopic(Publish, #[source] TopicParseError),
}

/// Publishes handed to receivers, and the ack tokens of receivers that closed mid-dispatch.
pub struct Dispatched {
    pub receivers: usize,
    pub orphaned: Vec<AckToken>,
}

#[derive(Default)]
pub struct IncomingPublishDispatcher {
    filtered_txs: HashMap<TopicFilter, Vec<UnboundedSender<DispatchItem>>>,
}

impl IncomingPublishDispatcher {
    /// Register a topic filter for dispatching.
    ///
    /// Returns a receiver that will receive incoming publishes published to the topic filter.
    /// Multiple receivers can be registered for the same topic filter.
    /// Receivers that have been dropped are removed on the next registration or dispatch.
    pub fn register_filter(&mut self, topic_filter: &TopicFilter) -> UnboundedReceiver<DispatchItem> {
        self.prune();
        let (tx, rx) = unbounded_channel();
        self.filtered_txs
            .entry(topic_filter.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Dispatch a [`Publish`] to every registered receiver whose filter matches its topic name.
    ///
    /// Each receiver gets its own [`AckToken`]. The broker is acknowledged once all of them are consumed.
    ///
    /// # Errors
    /// Returns a [`DispatchError`] carrying the publish back if it could not be dispatched.
    pub fn dispatch_publish(
        &mut self,
        publish: Publish,
        acker: &Arc<dyn MqttAck + Send + Sync>,
    ) -> Result<Dispatched, DispatchError> {
        self.prune();
        let topic_name = match TopicName::from_str(&publish.topic) {
            Ok(topic_name) => topic_name,
            Err(e) => return Err(DispatchError::InvalidTopic(publish, e)),
        };

        let matching: Vec<&UnboundedSender<DispatchItem>> = self
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(&topic_name))
            .flat_map(|(_, txs)| txs.iter())
            .collect();
        if matching.is_empty() {
            return Err(DispatchError::Unmatched(publish));
        }

        let tokens = AckToken::split(publish.clone(), acker.clone(), matching.len());
        let mut dispatched = Dispatched {
            receivers: 0,
            orphaned: vec![],
        };
        for (tx, token) in matching.into_iter().zip(tokens) {
            // A receiver may close between the prune and the send
            match tx.send((publish.clone(), token)) {
                Ok(()) => dispatched.receivers += 1,
                Err(e) => dispatched.orphaned.push(e.0 .1),
            }
        }
        Ok(dispatched)
    }

    /// Remove any closed filter receivers.
    fn prune(&mut self) {
        self.filtered_txs.retain(|_, v| {
            v.retain(|tx| !tx.is_closed());
            !v.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::control_packet::{PublishProperties, QoS};
    use crate::error::AckError;

    #[derive(Default)]
    struct RecordingAcker(Mutex<Vec<u16>>);

    #[async_trait]
    impl MqttAck for RecordingAcker {
        async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
            self.0.lock().unwrap().push(publish.pkid);
            Ok(())
        }
    }

    fn create_publish(topic: &str, pkid: u16) -> Publish {
        let mut publish = Publish::new(
            topic,
            QoS::AtLeastOnce,
            "{\"dni\":\"12345678\"}",
            PublishProperties::default(),
        );
        publish.pkid = pkid;
        publish
    }

    fn acker() -> (Arc<RecordingAcker>, Arc<dyn MqttAck + Send + Sync>) {
        let recording = Arc::new(RecordingAcker::default());
        let acker: Arc<dyn MqttAck + Send + Sync> = recording.clone();
        (recording, acker)
    }

    #[test]
    fn dispatch_no_filters() {
        let mut dispatcher = IncomingPublishDispatcher::default();
        let (_, acker) = acker();
        let result =
            dispatcher.dispatch_publish(create_publish("rabbit_exchange/reniec_operation", 1), &acker);
        assert!(matches!(result, Err(DispatchError::Unmatched(p)) if p.pkid == 1));
    }

    #[test]
    fn dispatch_shared_subscription_filter() {
        let mut dispatcher = IncomingPublishDispatcher::default();
        let (_, acker) = acker();
        let filter =
            TopicFilter::from_str("$share/reniec_queue/rabbit_exchange/reniec_operation").unwrap();
        let mut rx = dispatcher.register_filter(&filter);

        let publish = create_publish("rabbit_exchange/reniec_operation", 1);
        let dispatched = dispatcher.dispatch_publish(publish.clone(), &acker).unwrap();
        assert_eq!(dispatched.receivers, 1);
        let (received, token) = rx.try_recv().unwrap();
        assert_eq!(received, publish);
        assert_eq!(token.pkid(), 1);
    }

    #[tokio::test]
    async fn dispatch_to_overlapping_filters_acks_once() {
        let mut dispatcher = IncomingPublishDispatcher::default();
        let (recording, acker) = acker();
        let mut rx1 =
            dispatcher.register_filter(&TopicFilter::from_str("clients/load-client-0/reply").unwrap());
        let mut rx2 = dispatcher.register_filter(&TopicFilter::from_str("clients/+/reply").unwrap());
        let mut rx3 =
            dispatcher.register_filter(&TopicFilter::from_str("rabbit_exchange/#").unwrap());

        let dispatched = dispatcher
            .dispatch_publish(create_publish("clients/load-client-0/reply", 4), &acker)
            .unwrap();
        assert_eq!(dispatched.receivers, 2);
        assert!(rx3.try_recv().is_err());

        let (_, token1) = rx1.try_recv().unwrap();
        let (_, token2) = rx2.try_recv().unwrap();
        token1.ack().await.unwrap();
        assert!(recording.0.lock().unwrap().is_empty());
        token2.ack().await.unwrap();
        assert_eq!(*recording.0.lock().unwrap(), vec![4]);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let mut dispatcher = IncomingPublishDispatcher::default();
        let (_, acker) = acker();
        let filter = TopicFilter::from_str("clients/load-client-0/reply").unwrap();
        let rx = dispatcher.register_filter(&filter);
        drop(rx);

        let result =
            dispatcher.dispatch_publish(create_publish("clients/load-client-0/reply", 2), &acker);
        assert!(matches!(result, Err(DispatchError::Unmatched(_))));
        assert!(dispatcher.filtered_txs.is_empty());
    }
}
