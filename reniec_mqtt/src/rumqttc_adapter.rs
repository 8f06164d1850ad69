// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapter layer for the rumqttc crate

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5 as rumqttc_packet;
use rumqttc::v5::mqttbytes::QoS as RumqttcQoS;
use thiserror::Error;

use crate::connection_settings::MqttConnectionSettings;
use crate::control_packet::{ConnAck, Event, Publish, PublishProperties, QoS};
use crate::error::{AckError, ConnectionError, DisconnectError, PublishError, SubscribeError};
use crate::interface::{MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub};
use crate::topic::{TopicFilter, TopicName};

pub type ClientAlias = rumqttc::v5::AsyncClient;
pub type EventLoopAlias = rumqttc::v5::EventLoop;

// NOTE: rumqttc only reports a ClientError when the request channel to the event loop is
// closed. Topic validation is done ahead of the call, so every ClientError means the client
// is detached.
macro_rules! detached_from_client_error {
    ($($error:ty),*) => {
        $(
            impl From<rumqttc::v5::ClientError> for $error {
                fn from(_: rumqttc::v5::ClientError) -> Self {
                    <$error>::DetachedClient
                }
            }
        )*
    };
}

detached_from_client_error!(PublishError, SubscribeError, AckError, DisconnectError);

impl From<rumqttc::v5::ConnectionError> for ConnectionError {
    fn from(err: rumqttc::v5::ConnectionError) -> Self {
        match err {
            rumqttc::v5::ConnectionError::ConnectionRefused(code) => {
                ConnectionError::ConnectionRefused(format!("{code:?}"))
            }
            rumqttc::v5::ConnectionError::RequestsDone => ConnectionError::RequestsDone,
            rumqttc::v5::ConnectionError::MqttState(e) => ConnectionError::Protocol(e.to_string()),
            e => ConnectionError::Network(e.to_string()),
        }
    }
}

fn to_rumqttc_qos(qos: QoS) -> RumqttcQoS {
    match qos {
        QoS::AtMostOnce => RumqttcQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttcQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttcQoS::ExactlyOnce,
    }
}

fn from_rumqttc_qos(qos: RumqttcQoS) -> QoS {
    match qos {
        RumqttcQoS::AtMostOnce => QoS::AtMostOnce,
        RumqttcQoS::AtLeastOnce => QoS::AtLeastOnce,
        RumqttcQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn to_rumqttc_properties(properties: PublishProperties) -> rumqttc_packet::PublishProperties {
    let mut rumqttc_properties = rumqttc_packet::PublishProperties::default();
    rumqttc_properties.correlation_data = properties.correlation_data;
    rumqttc_properties.response_topic = properties.response_topic;
    rumqttc_properties.content_type = properties.content_type;
    rumqttc_properties.user_properties = properties.user_properties;
    rumqttc_properties
}

fn from_rumqttc_publish(publish: rumqttc_packet::Publish) -> Publish {
    let properties = publish
        .properties
        .map(|p| PublishProperties {
            correlation_data: p.correlation_data,
            response_topic: p.response_topic,
            content_type: p.content_type,
            user_properties: p.user_properties,
        })
        .unwrap_or_default();
    Publish {
        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
        qos: from_rumqttc_qos(publish.qos),
        pkid: publish.pkid,
        dup: publish.dup,
        payload: publish.payload,
        properties,
    }
}

#[async_trait]
impl MqttPubSub for rumqttc::v5::AsyncClient {
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
        Ok(self
            .publish_with_properties(
                topic,
                to_rumqttc_qos(qos),
                false,
                payload.into(),
                to_rumqttc_properties(properties),
            )
            .await?)
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError> {
        let topic = topic.into();
        if !TopicFilter::is_valid_topic_filter(&topic) {
            return Err(SubscribeError::InvalidTopicFilter);
        }
        Ok(rumqttc::v5::AsyncClient::subscribe(self, topic, to_rumqttc_qos(qos)).await?)
    }
}

#[async_trait]
impl MqttAck for rumqttc::v5::AsyncClient {
    async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
        // rumqttc only reads the QoS and packet identifier when acking
        let mut rumqttc_publish = rumqttc_packet::Publish::new(
            publish.topic.clone(),
            to_rumqttc_qos(publish.qos),
            Bytes::new(),
            None,
        );
        rumqttc_publish.pkid = publish.pkid;
        Ok(rumqttc::v5::AsyncClient::ack(self, &rumqttc_publish).await?)
    }
}

#[async_trait]
impl MqttDisconnect for rumqttc::v5::AsyncClient {
    async fn disconnect(&self) -> Result<(), DisconnectError> {
        Ok(rumqttc::v5::AsyncClient::disconnect(self).await?)
    }
}

#[async_trait]
impl MqttEventLoop for rumqttc::v5::EventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        match rumqttc::v5::EventLoop::poll(self).await? {
            rumqttc::v5::Event::Incoming(rumqttc_packet::Packet::ConnAck(connack)) => {
                Ok(Event::ConnAck(ConnAck {
                    session_present: connack.session_present,
                }))
            }
            rumqttc::v5::Event::Incoming(rumqttc_packet::Packet::Publish(publish)) => {
                Ok(Event::Publish(from_rumqttc_publish(publish)))
            }
            _ => Ok(Event::Other),
        }
    }
}

/// Create a rumqttc client and event loop with manual acknowledgement enabled.
pub fn client(
    connection_settings: MqttConnectionSettings,
    channel_capacity: usize,
) -> Result<(rumqttc::v5::AsyncClient, rumqttc::v5::EventLoop), ConnectionSettingsAdapterError> {
    // NOTE: rumqttc panics on a channel capacity of usize::MAX
    if channel_capacity == usize::MAX {
        return Err(ConnectionSettingsAdapterError {
            msg: "channel capacity must be less than usize::MAX".to_string(),
            field: ConnectionSettingsField::ChannelCapacity(channel_capacity),
        });
    }
    let mut mqtt_options: rumqttc::v5::MqttOptions = connection_settings.try_into()?;
    mqtt_options.set_manual_acks(true);
    Ok(rumqttc::v5::AsyncClient::new(
        mqtt_options,
        channel_capacity,
    ))
}

#[derive(Error, Debug)]
#[error("{msg}: {field:?}")]
pub struct ConnectionSettingsAdapterError {
    msg: String,
    field: ConnectionSettingsField,
}

#[derive(Debug)]
pub enum ConnectionSettingsField {
    SessionExpiry(Duration),
    KeepAlive(Duration),
    ChannelCapacity(usize),
}

impl TryFrom<MqttConnectionSettings> for rumqttc::v5::MqttOptions {
    type Error = ConnectionSettingsAdapterError;

    fn try_from(value: MqttConnectionSettings) -> Result<Self, Self::Error> {
        let mut mqtt_options =
            rumqttc::v5::MqttOptions::new(value.client_id, value.hostname, value.tcp_port);
        // rumqttc rejects a keep alive below one second other than zero
        if !value.keep_alive.is_zero() && value.keep_alive < Duration::from_secs(1) {
            return Err(ConnectionSettingsAdapterError {
                msg: "keep alive must be zero or at least 1 second".to_string(),
                field: ConnectionSettingsField::KeepAlive(value.keep_alive),
            });
        }
        mqtt_options.set_keep_alive(value.keep_alive);
        mqtt_options.set_receive_maximum(Some(value.receive_max));
        let session_expiry =
            u32::try_from(value.session_expiry.as_secs()).map_err(|_| {
                ConnectionSettingsAdapterError {
                    msg: "cannot convert to u32".to_string(),
                    field: ConnectionSettingsField::SessionExpiry(value.session_expiry),
                }
            })?;
        match session_expiry {
            // Session ends with the connection
            0 => mqtt_options.set_session_expiry_interval(None),
            1..=4 => {
                return Err(ConnectionSettingsAdapterError {
                    msg: "require zero or at least 5 seconds".to_string(),
                    field: ConnectionSettingsField::SessionExpiry(value.session_expiry),
                });
            }
            se => mqtt_options.set_session_expiry_interval(Some(se)),
        };
        mqtt_options.set_connection_timeout(value.connection_timeout.as_secs());
        mqtt_options.set_clean_start(value.clean_start);
        if let Some(username) = value.username {
            mqtt_options.set_credentials(username, value.password.unwrap_or_default());
        }
        Ok(mqtt_options)
    }
}
