// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use thiserror::Error;

/// Error polling the connection to the broker
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The broker refused the connection. Retrying will not help.
    #[error("connection refused by broker: {0}")]
    ConnectionRefused(String),
    /// The network connection failed or was lost
    #[error("network error: {0}")]
    Network(String),
    /// The connection violated the MQTT protocol or the client state
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The client handles were dropped and no further requests will arrive
    #[error("all client handles dropped")]
    RequestsDone,
}

/// Error executing a publish
#[derive(Debug, Error)]
pub enum PublishError {
    /// Client is detached from connection/event loop. Cannot send requests.
    #[error("client is detached from connection/event loop")]
    DetachedClient,
    /// Invalid topic name provided
    #[error("invalid topic name")]
    InvalidTopicName,
}

/// Error executing a subscribe
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// Client is detached from connection/event loop. Cannot send requests.
    #[error("client is detached from connection/event loop")]
    DetachedClient,
    /// Invalid topic filter provided
    #[error("invalid topic filter")]
    InvalidTopicFilter,
}

/// Error acknowledging a publish
#[derive(Debug, Error, Clone)]
pub enum AckError {
    /// Client is detached from connection/event loop. Cannot send requests.
    #[error("client is detached from connection/event loop")]
    DetachedClient,
}

/// Error executing a disconnect
#[derive(Debug, Error)]
pub enum DisconnectError {
    /// Client is detached from connection/event loop. Cannot send requests.
    #[error("client is detached from connection/event loop")]
    DetachedClient,
}
