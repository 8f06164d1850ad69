// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Topic names, topic filters and the request/reply topology built from them.
//!
//! Exchange, queue and routing key concepts map onto MQTT topics as follows:
//! - a request for `routing_key` on `exchange` is published to `{namespace}/{exchange}/{routing_key}`
//! - the durable queue `queue` bound to that key is the shared subscription
//!   `$share/{queue}/{namespace}/{exchange}/{routing_key}`
//! - the reply destination of a client is `{namespace}/clients/{client_id}/reply`
//!
//! The namespace level is omitted when the namespace is `/` or empty.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const LEVEL_SEPARATOR: char = '/';
const MULTI_LEVEL_WILDCARD: &str = "#";
const SINGLE_LEVEL_WILDCARD: &str = "+";
const SHARE_PREFIX: &str = "$share";

/// Error when parsing a topic name or topic filter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicParseError {
    /// The topic name or topic filter is empty
    #[error("must be at least one character long")]
    Empty,
    /// The topic name contains a wildcard character (# or +)
    #[error("wildcard characters not allowed in topic name: {0}")]
    WildcardInTopicName(String),
    /// A wildcard character (# or +) does not occupy an entire level of the topic filter
    #[error("wildcard characters must occupy an entire level of the topic filter: {0}")]
    WildcardNotAlone(String),
    /// A multi-level wildcard (#) is not the last level of the topic filter
    #[error("multi-level wildcard must be the last level: {0}")]
    WildcardNotLast(String),
    /// The topic name's first level is $share
    #[error("first level of a topic name must not be $share: {0}")]
    SharedSubscriptionNotAllowed(String),
    /// The share name of a shared subscription is empty or contains a wildcard
    #[error("share name must not be empty or contain wildcard characters: {0}")]
    InvalidShareName(String),
    /// A shared subscription does not contain a topic filter after the share name
    #[error("shared subscription must contain a topic filter: {0}")]
    SharedSubscriptionTooShort(String),
    /// A topology element (exchange, queue, routing key, client id) is not a single plain level
    #[error("{0} must be a non-empty single topic level without wildcards")]
    InvalidTopologyElement(&'static str),
}

/// An MQTT topic name that publishes can be sent to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    /// Get the [`TopicName`] formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the string is a valid MQTT topic name
    #[must_use]
    pub fn is_valid_topic_name(topic_name: &str) -> bool {
        check_topic_name(topic_name).is_ok()
    }

    /// Check if the [`TopicName`] matches given [`TopicFilter`]
    #[must_use]
    pub fn matches_topic_filter(&self, topic_filter: &TopicFilter) -> bool {
        topic_filter.matches_topic_name(self)
    }
}

impl FromStr for TopicName {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_topic_name(s)?;
        Ok(TopicName(s.to_string()))
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An MQTT topic filter, optionally a shared subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    /// Full filter as sent in a SUBSCRIBE
    raw: String,
    /// Share name when the filter is a shared subscription
    share_name: Option<String>,
    /// Byte offset in `raw` where the filter levels used for matching start
    filter_start: usize,
}

impl TopicFilter {
    /// Get the [`TopicFilter`] formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Share name of a shared subscription, if this is one
    #[must_use]
    pub fn share_name(&self) -> Option<&str> {
        self.share_name.as_deref()
    }

    /// The filter without any shared subscription prefix
    #[must_use]
    pub fn matching_filter(&self) -> &str {
        &self.raw[self.filter_start..]
    }

    /// Returns true if the string is a valid MQTT topic filter
    #[must_use]
    pub fn is_valid_topic_filter(topic_filter: &str) -> bool {
        TopicFilter::from_str(topic_filter).is_ok()
    }

    /// Check if the [`TopicFilter`] matches given [`TopicName`]
    #[must_use]
    pub fn matches_topic_name(&self, topic_name: &TopicName) -> bool {
        let mut name_levels = topic_name.as_str().split(LEVEL_SEPARATOR);
        for filter_level in self.matching_filter().split(LEVEL_SEPARATOR) {
            if filter_level == MULTI_LEVEL_WILDCARD {
                return true;
            }
            match name_levels.next() {
                Some(_) if filter_level == SINGLE_LEVEL_WILDCARD => {}
                Some(name_level) if name_level == filter_level => {}
                _ => return false,
            }
        }
        name_levels.next().is_none()
    }
}

impl FromStr for TopicFilter {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (share_name, filter_start) = if is_shared_sub(s) {
            let mut parts = s.splitn(3, LEVEL_SEPARATOR);
            parts.next();
            let share_name = parts
                .next()
                .ok_or_else(|| TopicParseError::SharedSubscriptionTooShort(s.to_string()))?;
            if share_name.is_empty()
                || share_name.contains(MULTI_LEVEL_WILDCARD)
                || share_name.contains(SINGLE_LEVEL_WILDCARD)
            {
                return Err(TopicParseError::InvalidShareName(s.to_string()));
            }
            let filter = parts
                .next()
                .ok_or_else(|| TopicParseError::SharedSubscriptionTooShort(s.to_string()))?;
            if filter.is_empty() {
                return Err(TopicParseError::SharedSubscriptionTooShort(s.to_string()));
            }
            (
                Some(share_name.to_string()),
                SHARE_PREFIX.len() + share_name.len() + 2,
            )
        } else {
            (None, 0)
        };
        check_filter_levels(&s[filter_start..], s)?;
        Ok(TopicFilter {
            raw: s.to_string(),
            share_name,
            filter_start,
        })
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn check_topic_name(topic_name: &str) -> Result<(), TopicParseError> {
    if topic_name.is_empty() {
        return Err(TopicParseError::Empty);
    }
    if topic_name.contains(MULTI_LEVEL_WILDCARD) || topic_name.contains(SINGLE_LEVEL_WILDCARD) {
        return Err(TopicParseError::WildcardInTopicName(topic_name.to_string()));
    }
    if is_shared_sub(topic_name) {
        return Err(TopicParseError::SharedSubscriptionNotAllowed(
            topic_name.to_string(),
        ));
    }
    Ok(())
}

fn check_filter_levels(filter: &str, original: &str) -> Result<(), TopicParseError> {
    if filter.is_empty() {
        return Err(TopicParseError::Empty);
    }
    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        if level.contains(MULTI_LEVEL_WILDCARD) {
            if level != MULTI_LEVEL_WILDCARD {
                return Err(TopicParseError::WildcardNotAlone(original.to_string()));
            }
            if levels.peek().is_some() {
                return Err(TopicParseError::WildcardNotLast(original.to_string()));
            }
        }
        if level.contains(SINGLE_LEVEL_WILDCARD) && level != SINGLE_LEVEL_WILDCARD {
            return Err(TopicParseError::WildcardNotAlone(original.to_string()));
        }
    }
    Ok(())
}

fn is_shared_sub(topic: &str) -> bool {
    topic == SHARE_PREFIX || topic.starts_with("$share/")
}

/// A single plain topic level: non-empty, no separator, no wildcard, no `$` prefix.
fn check_element(value: &str, element: &'static str) -> Result<(), TopicParseError> {
    if value.is_empty()
        || value.contains(LEVEL_SEPARATOR)
        || value.contains(MULTI_LEVEL_WILDCARD)
        || value.contains(SINGLE_LEVEL_WILDCARD)
        || value.starts_with('$')
    {
        return Err(TopicParseError::InvalidTopologyElement(element));
    }
    Ok(())
}

/// Topic prefix for a namespace, including the trailing separator.
/// Empty for the default namespace.
fn namespace_prefix(namespace: &str) -> String {
    let trimmed = namespace.trim_matches(LEVEL_SEPARATOR);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}{LEVEL_SEPARATOR}")
    }
}

/// Topic a publish to `exchange` with `routing_key` is sent to.
///
/// # Errors
/// Returns [`TopicParseError`] if the exchange or routing key is not a single plain level.
pub fn publish_topic(
    namespace: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<TopicName, TopicParseError> {
    check_element(exchange, "exchange")?;
    check_element(routing_key, "routing key")?;
    TopicName::from_str(&format!(
        "{}{exchange}/{routing_key}",
        namespace_prefix(namespace)
    ))
}

/// Exclusive reply destination of a client.
///
/// # Errors
/// Returns [`TopicParseError`] if the client id is not a single plain level.
pub fn reply_topic(namespace: &str, client_id: &str) -> Result<TopicName, TopicParseError> {
    check_element(client_id, "client id")?;
    TopicName::from_str(&format!(
        "{}clients/{client_id}/reply",
        namespace_prefix(namespace)
    ))
}

/// A durable queue bound to an exchange by a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    queue: String,
    routing_key: String,
    request_topic: TopicName,
    queue_filter: TopicFilter,
}

impl Topology {
    /// Describe a queue `queue` bound to `exchange` with `routing_key` within `namespace`.
    ///
    /// # Errors
    /// Returns [`TopicParseError`] if any element is not a single plain topic level.
    pub fn new(
        namespace: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<Self, TopicParseError> {
        check_element(queue, "queue")?;
        let request_topic = publish_topic(namespace, exchange, routing_key)?;
        let queue_filter = TopicFilter::from_str(&format!(
            "{SHARE_PREFIX}/{queue}/{}",
            request_topic.as_str()
        ))?;
        Ok(Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            request_topic,
            queue_filter,
        })
    }

    /// Exchange name
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Queue name
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Routing key binding the queue to the exchange
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Topic requests routed to the queue are published to
    #[must_use]
    pub fn request_topic(&self) -> &TopicName {
        &self.request_topic
    }

    /// Shared subscription filter that consumes from the queue
    #[must_use]
    pub fn queue_filter(&self) -> &TopicFilter {
        &self.queue_filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("rabbit_exchange/reniec_operation"; "request topic")]
    #[test_case("clients/load-client-0/reply"; "reply topic")]
    #[test_case("reniec/rabbit_exchange/reniec_operation"; "namespaced topic")]
    #[test_case("a//b/"; "zero-length levels")]
    #[test_case("$shareholders/x"; "not a shared subscription")]
    fn valid_topic_name(topic_name: &str) {
        assert!(TopicName::is_valid_topic_name(topic_name));
    }

    #[test_case(""; "empty")]
    #[test_case("rabbit_exchange/+"; "single-level wildcard")]
    #[test_case("rabbit_exchange/#"; "multi-level wildcard")]
    #[test_case("$share/reniec_queue/rabbit_exchange/reniec_operation"; "shared subscription")]
    fn invalid_topic_name(topic_name: &str) {
        assert!(!TopicName::is_valid_topic_name(topic_name));
    }

    #[test_case("rabbit_exchange/reniec_operation"; "plain filter")]
    #[test_case("clients/+/reply"; "single-level wildcard")]
    #[test_case("clients/#"; "multi-level wildcard")]
    #[test_case("$share/reniec_queue/rabbit_exchange/reniec_operation"; "shared subscription")]
    #[test_case("$share/reniec_queue/#"; "shared subscription with wildcard")]
    fn valid_topic_filter(topic_filter: &str) {
        assert!(TopicFilter::is_valid_topic_filter(topic_filter));
    }

    #[test_case(""; "empty")]
    #[test_case("clients+/reply"; "single-level wildcard not alone")]
    #[test_case("clients/#/reply"; "multi-level wildcard not last")]
    #[test_case("$share"; "share prefix only")]
    #[test_case("$share/reniec_queue"; "share name only")]
    #[test_case("$share/reniec_queue/"; "share with empty filter")]
    #[test_case("$share//rabbit_exchange"; "empty share name")]
    #[test_case("$share/+/rabbit_exchange"; "wildcard share name")]
    fn invalid_topic_filter(topic_filter: &str) {
        assert!(!TopicFilter::is_valid_topic_filter(topic_filter));
    }

    #[test_case("rabbit_exchange/reniec_operation", "rabbit_exchange/reniec_operation", true; "exact")]
    #[test_case("rabbit_exchange/reniec_operation", "rabbit_exchange/bank_operation", false; "exact mismatch")]
    #[test_case("clients/+/reply", "clients/load-client-1/reply", true; "single-level wildcard")]
    #[test_case("clients/+/reply", "clients/a/b/reply", false; "single-level wildcard spans one level")]
    #[test_case("clients/#", "clients/load-client-1/reply", true; "multi-level wildcard")]
    #[test_case("rabbit_exchange", "rabbit_exchange/reniec_operation", false; "filter shorter than name")]
    #[test_case("rabbit_exchange/reniec_operation/x", "rabbit_exchange/reniec_operation", false; "filter longer than name")]
    #[test_case("$share/reniec_queue/rabbit_exchange/reniec_operation", "rabbit_exchange/reniec_operation", true; "shared subscription")]
    #[test_case("$share/reniec_queue/rabbit_exchange/reniec_operation", "reniec_queue/rabbit_exchange", false; "shared subscription ignores share name")]
    fn topic_matching(topic_filter: &str, topic_name: &str, matches: bool) {
        let topic_filter = TopicFilter::from_str(topic_filter).unwrap();
        let topic_name = TopicName::from_str(topic_name).unwrap();
        assert_eq!(topic_filter.matches_topic_name(&topic_name), matches);
        assert_eq!(topic_name.matches_topic_filter(&topic_filter), matches);
    }

    #[test]
    fn shared_subscription_parts() {
        let filter =
            TopicFilter::from_str("$share/reniec_queue/rabbit_exchange/reniec_operation").unwrap();
        assert_eq!(filter.share_name(), Some("reniec_queue"));
        assert_eq!(filter.matching_filter(), "rabbit_exchange/reniec_operation");
    }

    #[test_case("/"; "root namespace")]
    #[test_case(""; "empty namespace")]
    fn topology_default_namespace(namespace: &str) {
        let topology =
            Topology::new(namespace, "rabbit_exchange", "reniec_queue", "reniec_operation")
                .unwrap();
        assert_eq!(
            topology.request_topic().as_str(),
            "rabbit_exchange/reniec_operation"
        );
        assert_eq!(
            topology.queue_filter().as_str(),
            "$share/reniec_queue/rabbit_exchange/reniec_operation"
        );
        assert!(topology
            .queue_filter()
            .matches_topic_name(topology.request_topic()));
    }

    #[test]
    fn topology_namespace_prefix() {
        let topology =
            Topology::new("/reniec/", "rabbit_exchange", "reniec_queue", "reniec_operation")
                .unwrap();
        assert_eq!(
            topology.request_topic().as_str(),
            "reniec/rabbit_exchange/reniec_operation"
        );
        assert_eq!(
            topology.queue_filter().as_str(),
            "$share/reniec_queue/reniec/rabbit_exchange/reniec_operation"
        );
        assert_eq!(
            reply_topic("reniec", "load-client-0").unwrap().as_str(),
            "reniec/clients/load-client-0/reply"
        );
    }

    #[test_case("", "reniec_queue", "reniec_operation"; "empty exchange")]
    #[test_case("rabbit_exchange", "reniec/queue", "reniec_operation"; "queue with separator")]
    #[test_case("rabbit_exchange", "reniec_queue", "#"; "wildcard routing key")]
    #[test_case("$sys", "reniec_queue", "reniec_operation"; "dollar exchange")]
    fn topology_invalid_elements(exchange: &str, queue: &str, routing_key: &str) {
        assert!(Topology::new("/", exchange, queue, routing_key).is_err());
    }

    #[test]
    fn reply_topic_invalid_client_id() {
        assert!(reply_topic("/", "load/client").is_err());
        assert!(reply_topic("/", "").is_err());
    }
}
