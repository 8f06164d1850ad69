// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Broker connection settings

use std::env::{self, VarError};
use std::time::Duration;

/// All the settings required to establish a broker connection.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", derive(Clone), setter(into), build_fn(validate = "Self::validate"))]
pub struct MqttConnectionSettings {
    /// Client identifier. Also serves as the human-readable connection name.
    pub(crate) client_id: String,
    /// FQDN of the host to connect to
    #[builder(default = "\"localhost\".to_string()")]
    pub(crate) hostname: String,
    /// TCP port to connect to the host on
    #[builder(default = "1883")]
    pub(crate) tcp_port: u16,
    /// Heartbeat interval
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) keep_alive: Duration,
    /// Max time to wait for the broker to accept a connection
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) connection_timeout: Duration,
    /// Max number of unacknowledged QoS 1 deliveries the broker may hand this connection
    #[builder(default = "u16::MAX")]
    pub(crate) receive_max: u16,
    /// Session Expiry Interval. Zero means the session ends with the connection.
    #[builder(default = "Duration::from_secs(3600)")]
    pub(crate) session_expiry: Duration,
    /// Clean start
    #[builder(default = "false")]
    pub(crate) clean_start: bool,
    /// Username for the broker
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for the broker
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// Virtual namespace. `/` or empty means topics carry no prefix.
    #[builder(default = "\"/\".to_string()")]
    pub(crate) namespace: String,
}

impl MqttConnectionSettings {
    /// Client identifier used for the connection
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Virtual namespace of the connection
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Max number of unacknowledged deliveries allowed in flight
    #[must_use]
    pub fn receive_max(&self) -> u16 {
        self.receive_max
    }
}

impl MqttConnectionSettingsBuilder {
    /// Initialize the [`MqttConnectionSettingsBuilder`] from environment variables.
    ///
    /// Unset variables are left to the builder defaults.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("BROKER_CLIENT_ID")?;
        let hostname = string_from_environment("BROKER_HOSTNAME")?;
        let tcp_port = string_from_environment("BROKER_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("BROKER_TCP_PORT: {e}"))?;
        let keep_alive = seconds_from_environment("BROKER_KEEP_ALIVE")?;
        let connection_timeout = seconds_from_environment("BROKER_CONNECTION_TIMEOUT")?;
        let session_expiry = seconds_from_environment("BROKER_SESSION_EXPIRY")?;
        let receive_max = string_from_environment("BROKER_RECEIVE_MAX")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("BROKER_RECEIVE_MAX: {e}"))?;
        let clean_start = string_from_environment("BROKER_CLEAN_START")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("BROKER_CLEAN_START: {e}"))?;
        let username = string_from_environment("BROKER_USERNAME")?;
        let password = string_from_environment("BROKER_PASSWORD")?;
        let namespace = string_from_environment("BROKER_NAMESPACE")?;

        // NOTE: Missing values are not an error here, since callers commonly override them
        // (e.g. a per-worker client id) before calling .build().
        if hostname.is_none() {
            log::debug!("BROKER_HOSTNAME is not set in environment, using default");
        }

        let mut builder = Self::default();
        builder.client_id = client_id;
        builder.hostname = hostname;
        builder.tcp_port = tcp_port;
        builder.keep_alive = keep_alive;
        builder.connection_timeout = connection_timeout;
        builder.session_expiry = session_expiry;
        builder.receive_max = receive_max;
        builder.clean_start = clean_start;
        // Only wrap values that are present so builder defaults still apply otherwise
        builder.username = username.map(Some);
        builder.password = password.map(Some);
        builder.namespace = namespace;
        Ok(builder)
    }

    /// Use `client_id` unless a client id was already set.
    #[must_use]
    pub fn default_client_id(mut self, client_id: impl Into<String>) -> Self {
        if self.client_id.is_none() {
            self.client_id = Some(client_id.into());
        }
        self
    }

    /// Validate the connection settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `hostname` is empty
    /// - `client_id` is empty and `clean_start` is false
    /// - `password` is set without a `username`
    /// - `receive_max` is zero
    /// - `keep_alive` does not fit in 16 bits of seconds
    /// - `session_expiry` does not fit in 32 bits of seconds
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("Host name cannot be empty".to_string());
            }
        }
        if let Some(client_id) = &self.client_id {
            // default for clean_start is false
            if client_id.is_empty() && !self.clean_start.unwrap_or(false) {
                return Err("client_id is mandatory when clean_start is set to false".to_string());
            }
        }
        if let Some(Some(_)) = &self.password {
            if !matches!(&self.username, Some(Some(_))) {
                return Err("password cannot be used without username".to_string());
            }
        }
        if self.receive_max == Some(0) {
            return Err("receive_max must be greater than zero".to_string());
        }
        if let Some(keep_alive) = self.keep_alive {
            if u16::try_from(keep_alive.as_secs()).is_err() {
                return Err("keep_alive must be less than 65536 seconds".to_string());
            }
        }
        if let Some(session_expiry) = self.session_expiry {
            if u32::try_from(session_expiry.as_secs()).is_err() {
                return Err("session_expiry must fit in 32 bits of seconds".to_string());
            }
        }
        Ok(())
    }
}

/// Helper function to get an environment variable as a string.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(format!(
            "Could not parse non-unicode environment variable {key}"
        )),
    }
}

/// Helper function to get an environment variable as a whole number of seconds.
fn seconds_from_environment(key: &str) -> Result<Option<Duration>, String> {
    string_from_environment(key)?
        .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
        .transpose()
        .map_err(|e| format!("{key}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn minimum_configuration() {
        let settings = MqttConnectionSettingsBuilder::default()
            .client_id("reniec-server".to_string())
            .build()
            .unwrap();
        assert_eq!(settings.hostname, "localhost");
        assert_eq!(settings.tcp_port, 1883);
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.connection_timeout, Duration::from_secs(60));
        assert_eq!(settings.namespace(), "/");
        assert_eq!(settings.receive_max(), u16::MAX);
        assert!(!settings.clean_start);
    }

    #[test]
    fn hostname() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("reniec-server".to_string())
            .hostname(String::new())
            .build();
        assert!(result.is_err());
    }

    #[test_case("", false, false; "empty client id without clean start")]
    #[test_case("", true, true; "empty client id with clean start")]
    #[test_case("load-client-0", false, true; "client id without clean start")]
    #[test_case("load-client-0", true, true; "client id with clean start")]
    fn client_id_clean_start_combos(client_id: &str, clean_start: bool, valid: bool) {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id(client_id.to_string())
            .clean_start(clean_start)
            .build();
        assert_eq!(result.is_ok(), valid);
    }

    #[test_case(Some("admin"), Some("admin"), true; "username and password")]
    #[test_case(Some("admin"), None, true; "username only")]
    #[test_case(None, Some("admin"), false; "password only")]
    fn credential_combos(username: Option<&str>, password: Option<&str>, valid: bool) {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("reniec-server".to_string())
            .username(username.map(ToString::to_string))
            .password(password.map(ToString::to_string))
            .build();
        assert_eq!(result.is_ok(), valid);
    }

    #[test]
    fn receive_max_zero() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("reniec-server".to_string())
            .receive_max(0u16)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn keep_alive_too_long() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("reniec-server".to_string())
            .keep_alive(Duration::from_secs(70_000))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn from_environment_full_configuration() {
        temp_env::with_vars(
            [
                ("BROKER_CLIENT_ID", Some("reniec-server")),
                ("BROKER_HOSTNAME", Some("broker.local")),
                ("BROKER_TCP_PORT", Some("1884")),
                ("BROKER_USERNAME", Some("admin")),
                ("BROKER_PASSWORD", Some("secret")),
                ("BROKER_NAMESPACE", Some("reniec")),
                ("BROKER_KEEP_ALIVE", Some("15")),
                ("BROKER_CONNECTION_TIMEOUT", Some("20")),
                ("BROKER_SESSION_EXPIRY", Some("600")),
                ("BROKER_CLEAN_START", Some("false")),
                ("BROKER_RECEIVE_MAX", Some("8")),
            ],
            || {
                let builder = MqttConnectionSettingsBuilder::from_environment().unwrap();
                assert_eq!(builder.client_id, Some("reniec-server".to_string()));
                assert_eq!(builder.hostname, Some("broker.local".to_string()));
                assert_eq!(builder.tcp_port, Some(1884));
                assert_eq!(builder.username, Some(Some("admin".to_string())));
                assert_eq!(builder.password, Some(Some("secret".to_string())));
                assert_eq!(builder.namespace, Some("reniec".to_string()));
                assert_eq!(builder.keep_alive, Some(Duration::from_secs(15)));
                assert_eq!(builder.connection_timeout, Some(Duration::from_secs(20)));
                assert_eq!(builder.session_expiry, Some(Duration::from_secs(600)));
                assert_eq!(builder.clean_start, Some(false));
                assert_eq!(builder.receive_max, Some(8));

                let settings = builder.build().unwrap();
                assert_eq!(settings.receive_max(), 8);
                assert_eq!(settings.namespace(), "reniec");
            },
        );
    }

    #[test]
    fn from_environment_minimal_configuration() {
        temp_env::with_vars(
            [
                ("BROKER_CLIENT_ID", Some("reniec-server")),
                ("BROKER_HOSTNAME", None::<&str>),
                ("BROKER_USERNAME", None),
                ("BROKER_PASSWORD", None),
            ],
            || {
                let builder = MqttConnectionSettingsBuilder::from_environment().unwrap();
                assert_eq!(builder.hostname, None);
                assert_eq!(builder.username, None);
                let settings = builder.build().unwrap();
                assert_eq!(settings.hostname, "localhost");
                assert_eq!(settings.username, None);
            },
        );
    }

    #[test]
    fn from_environment_missing_client_id() {
        temp_env::with_vars([("BROKER_CLIENT_ID", None::<&str>)], || {
            let builder = MqttConnectionSettingsBuilder::from_environment().unwrap();
            // Builds only once a client id is supplied
            assert!(builder.clone().build().is_err());
            assert!(builder.client_id("load-client-3").build().is_ok());
        });
    }

    #[test_case(Some("reniec-server-2"), "reniec-server-2"; "from environment")]
    #[test_case(None, "reniec-server"; "fallback")]
    fn from_environment_default_client_id(env_value: Option<&str>, expected: &str) {
        temp_env::with_var("BROKER_CLIENT_ID", env_value, || {
            let settings = MqttConnectionSettingsBuilder::from_environment()
                .unwrap()
                .default_client_id("reniec-server")
                .build()
                .unwrap();
            assert_eq!(settings.client_id(), expected);
        });
    }

    #[test_case("BROKER_TCP_PORT", "not numeric"; "tcp_port")]
    #[test_case("BROKER_KEEP_ALIVE", "not numeric"; "keep_alive")]
    #[test_case("BROKER_CONNECTION_TIMEOUT", "-1"; "connection_timeout")]
    #[test_case("BROKER_SESSION_EXPIRY", "not numeric"; "session_expiry")]
    #[test_case("BROKER_RECEIVE_MAX", "70000"; "receive_max")]
    #[test_case("BROKER_CLEAN_START", "not boolean"; "clean_start")]
    fn from_environment_nonstring_value_parsing(env_var: &str, invalid_value: &str) {
        temp_env::with_vars(
            [
                ("BROKER_CLIENT_ID", Some("reniec-server")),
                (env_var, Some(invalid_value)),
            ],
            || {
                // Fails on .from_environment(), not .build()
                assert!(MqttConnectionSettingsBuilder::from_environment().is_err());
            },
        );
    }
}
