// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connection and lifecycle state shared by a [`crate::session::Session`] and its exit handles.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Lifecycle {
    #[default]
    NotStarted,
    Running,
    Exited,
}

#[derive(Clone, Copy, Debug, Default)]
struct Status {
    lifecycle: Lifecycle,
    /// Best effort, the Session may not have noticed a dropped connection yet
    connected: bool,
    /// CONNACKs received so far
    connection_count: u32,
    /// The user asked the Session to end
    exit_requested: bool,
}

/// State of a Session. Every change is published to the waiters of the `condition_*` methods.
#[derive(Debug)]
pub struct SessionState {
    status: watch::Sender<Status>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: watch::channel(Status::default()).0,
        }
    }
}

impl SessionState {
    /// Mark the Session as running. Returns false if it was ever started before.
    pub fn start(&self) -> bool {
        let started = self.status.send_if_modified(|status| {
            if status.lifecycle == Lifecycle::NotStarted {
                status.lifecycle = Lifecycle::Running;
                true
            } else {
                false
            }
        });
        if started {
            log::info!("Session started");
        }
        started
    }

    /// Whether the Session has exited
    pub fn has_exited(&self) -> bool {
        self.status.borrow().lifecycle == Lifecycle::Exited
    }

    /// Whether the Session is connected, to the best of its knowledge
    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    /// Number of connections established so far
    pub fn connection_count(&self) -> u32 {
        self.status.borrow().connection_count
    }

    /// Whether the user asked the Session to end
    pub fn exit_requested(&self) -> bool {
        self.status.borrow().exit_requested
    }

    /// Wait until the Session is disconnected. Returns immediately if it already is.
    pub async fn condition_disconnected(&self) {
        self.wait_for(|status| !status.connected).await;
    }

    /// Wait until the Session has exited. Returns immediately if it already has.
    pub async fn condition_exited(&self) {
        self.wait_for(|status| status.lifecycle == Lifecycle::Exited)
            .await;
    }

    async fn wait_for(&self, condition: impl FnMut(&Status) -> bool) {
        let mut status = self.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = status.wait_for(condition).await;
    }

    /// Record a CONNACK
    pub fn transition_connected(&self) {
        self.status.send_if_modified(|status| {
            if status.connected {
                log::warn!("Duplicate connection");
                return false;
            }
            status.connected = true;
            status.connection_count += 1;
            log::info!("Connected! ({} connections so far)", status.connection_count);
            true
        });
    }

    /// Record a lost or closed connection
    pub fn transition_disconnected(&self) {
        self.status.send_if_modified(|status| {
            if !status.connected {
                return false;
            }
            status.connected = false;
            if status.exit_requested {
                log::info!("Disconnected due to user-initiated Session exit");
            } else {
                log::info!("Connection lost.");
            }
            true
        });
    }

    /// Record that the run loop has ended
    pub fn transition_exited(&self) {
        self.status.send_modify(|status| {
            status.lifecycle = Lifecycle::Exited;
            status.connected = false;
        });
        log::info!("Session exited");
    }

    /// Record that the user asked the Session to end
    pub fn request_exit(&self) {
        self.status.send_modify(|status| status.exit_requested = true);
        log::info!("User initiated Session exit process");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn lifecycle() {
        let state = SessionState::default();
        assert!(state.start());
        assert!(!state.start());
        state.transition_connected();
        state.transition_connected();
        state.transition_disconnected();
        state.transition_connected();
        assert_eq!(state.connection_count(), 2);
        assert!(!state.exit_requested());
        state.request_exit();
        assert!(state.exit_requested());
        state.transition_exited();
        assert!(state.has_exited());
        assert!(!state.is_connected());
        // An exited Session cannot be started again
        assert!(!state.start());
    }

    #[tokio::test]
    async fn condition_disconnected_wakes() {
        let state = Arc::new(SessionState::default());
        state.transition_connected();
        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.condition_disconnected().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        state.transition_disconnected();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn condition_exited_returns_when_already_exited() {
        let state = SessionState::default();
        state.transition_exited();
        tokio::time::timeout(Duration::from_secs(1), state.condition_exited())
            .await
            .unwrap();
    }
}
