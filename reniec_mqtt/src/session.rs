// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT client providing a managed connection with automatic reconnection across a single MQTT session.

mod dispatcher;
mod managed_client;
pub mod reconnect_policy;
#[allow(clippy::module_inception)]
mod session;
mod state;

use thiserror::Error;

use crate::error::{ConnectionError, DisconnectError};
use crate::rumqttc_adapter as adapter;
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
use crate::MqttConnectionSettings;

pub use managed_client::{SessionManagedClient, SessionPubReceiver};
pub use session::{Session, SessionExitHandle};

/// Error type for sessions
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionError(#[from] SessionErrorKind);

impl SessionError {
    /// Return the corresponding [`SessionErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &SessionErrorKind {
        &self.0
    }
}

/// Error kind for [`SessionError`].
#[derive(Error, Debug)]
pub enum SessionErrorKind {
    /// Invalid configuration options provided to the [`Session`].
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] adapter::ConnectionSettingsAdapterError),
    /// The initial connection to the broker could not be established.
    #[error("initial connection failed: {0}")]
    InitialConnectionFailed(ConnectionError),
    /// An unrecoverable connection error occurred.
    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),
    /// The reconnect attempts were halted by the reconnect policy.
    #[error("reconnection halted by reconnect policy")]
    ReconnectHalted,
    /// The [`Session`] was ended by a force exit.
    #[error("session ended by force exit")]
    ForceExit,
    /// The [`Session`] was used in an invalid way.
    #[error("{0}")]
    InvalidState(String),
}

/// Error type for exiting a [`Session`] using the [`SessionExitHandle`].
#[derive(Error, Debug)]
pub enum SessionExitError {
    /// The Session no longer exists, so the exit request could not be delivered.
    #[error("session dropped")]
    Dropped(#[from] DisconnectError),
    /// The Session is not connected to the broker, so a graceful exit could not complete.
    #[error("broker unavailable (attempted: {attempted})")]
    BrokerUnavailable {
        /// Indicates whether the exit was attempted before the unavailability was detected
        attempted: bool,
    },
    /// The exit attempt did not complete within the given timeout.
    #[error("session exit timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// Options for configuring a new [`Session`]
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionOptions {
    /// MQTT Connection Settings for configuring the [`Session`]
    pub connection_settings: MqttConnectionSettings,
    /// Reconnect Policy to by used by the `Session`
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    pub reconnect_policy: Box<dyn ReconnectPolicy + Send + Sync>,
    /// Capacity of the outgoing request queue to the broker connection
    #[builder(default = "100")]
    pub outgoing_max: usize,
}
