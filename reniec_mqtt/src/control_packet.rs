// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structs and enums describing the packets exchanged with the broker.

use bytes::Bytes;

/// Quality of Service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce,
    /// At least once delivery
    AtLeastOnce,
    /// Exactly once delivery
    ExactlyOnce,
}

/// Properties of a publish that are relevant for request/response messaging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Opaque token echoed between a request and its response
    pub correlation_data: Option<Bytes>,
    /// Topic a response to this publish should be sent to
    pub response_topic: Option<String>,
    /// Content type of the payload
    pub content_type: Option<String>,
    /// Application-defined key/value pairs
    pub user_properties: Vec<(String, String)>,
}

/// A publish received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    /// Topic name the publish was sent to
    pub topic: String,
    /// Quality of Service of the delivery
    pub qos: QoS,
    /// Packet identifier used to acknowledge the delivery. Zero for QoS 0.
    pub pkid: u16,
    /// Indicates the broker is redelivering this publish
    pub dup: bool,
    /// Application payload
    pub payload: Bytes,
    /// Publish properties
    pub properties: PublishProperties,
}

impl Publish {
    /// Create a new [`Publish`] that has not been assigned a packet identifier.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        qos: QoS,
        payload: impl Into<Bytes>,
        properties: PublishProperties,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            pkid: 0,
            dup: false,
            payload: payload.into(),
            properties,
        }
    }
}

/// Acknowledgement of a successful connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    /// Indicates the broker retained state from a previous session
    pub session_present: bool,
}

/// Events surfaced by polling an event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The broker accepted the connection
    ConnAck(ConnAck),
    /// A publish was delivered
    Publish(Publish),
    /// Any other packet or outgoing notification
    Other,
}
