// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message envelope and the request/response bodies carried by it.

use bytes::Bytes;
use reniec_mqtt::control_packet::{Publish, PublishProperties};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::lookup::PersonDetails;

/// Content type marking a JSON body
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Length of a normalized DNI
pub const DNI_LENGTH: usize = 8;

/// Error encoding or decoding an envelope body
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The body is not valid JSON, or could not be serialized to JSON
    #[error("malformed json body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metadata and body of one message exchanged over the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Caller-assigned token, echoed unchanged on the matching reply
    pub correlation_token: Option<String>,
    /// Where a reply must be published. `None` means no reply is possible.
    pub reply_destination: Option<String>,
    /// Kind of content in the body
    pub content_kind: Option<String>,
    /// Message body
    pub body: Bytes,
}

impl Envelope {
    /// Create a JSON request envelope.
    #[must_use]
    pub fn request(correlation_token: String, reply_destination: String, body: Bytes) -> Self {
        Self {
            correlation_token: Some(correlation_token),
            reply_destination: Some(reply_destination),
            content_kind: Some(CONTENT_TYPE_JSON.to_string()),
            body,
        }
    }

    /// Create the JSON reply envelope to `request`, echoing its correlation token.
    #[must_use]
    pub fn reply_to(request: &Envelope, body: Bytes) -> Self {
        Self {
            correlation_token: request.correlation_token.clone(),
            reply_destination: None,
            content_kind: Some(CONTENT_TYPE_JSON.to_string()),
            body,
        }
    }

    /// Read the envelope of a received publish.
    ///
    /// A correlation token that is not valid UTF-8 is treated as absent, as is an empty
    /// reply destination.
    #[must_use]
    pub fn from_publish(publish: &Publish) -> Self {
        let correlation_token = publish
            .properties
            .correlation_data
            .as_ref()
            .and_then(|data| String::from_utf8(data.to_vec()).ok());
        let reply_destination = publish
            .properties
            .response_topic
            .clone()
            .filter(|topic| !topic.is_empty());
        Self {
            correlation_token,
            reply_destination,
            content_kind: publish.properties.content_type.clone(),
            body: publish.payload.clone(),
        }
    }

    /// Publish properties carrying the envelope metadata.
    #[must_use]
    pub fn to_properties(&self) -> PublishProperties {
        PublishProperties {
            correlation_data: self
                .correlation_token
                .as_ref()
                .map(|token| Bytes::copy_from_slice(token.as_bytes())),
            response_topic: self.reply_destination.clone(),
            content_type: self.content_kind.clone(),
            ..Default::default()
        }
    }

    /// Parse the body as JSON.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Json`] if the body is not valid JSON.
    pub fn json_body(&self) -> Result<Value, EnvelopeError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Key found in a lookup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKey {
    /// Exactly eight digits remained after normalization
    Valid(String),
    /// A key was present but did not normalize to a DNI. Holds the digits that remained.
    Invalid(String),
    /// No key was present, or the body could not be decoded
    Missing,
}

/// Locations of the key in a request body, in the order they are tried.
const KEY_PATHS: [&[&str]; 4] = [
    &["dni"],
    &["data", "dni"],
    &["payload", "dni"],
    &["payload", "documento"],
];

/// Extract the key of a lookup request body.
///
/// Accepts `{dni}`, `{data:{dni}}`, `{payload:{dni}}` and `{payload:{documento}}`, taking the
/// first non-empty string or integer. Anything else, including a body that is not JSON,
/// yields [`RequestKey::Missing`].
#[must_use]
pub fn request_key(body: &[u8]) -> RequestKey {
    let Ok(request) = serde_json::from_slice::<Value>(body) else {
        return RequestKey::Missing;
    };
    let raw = KEY_PATHS.iter().find_map(|path| {
        let value = path
            .iter()
            .try_fold(&request, |value, field| value.get(field))?;
        key_text(value)
    });
    match raw {
        Some(raw) => normalize_key(&raw),
        None => RequestKey::Missing,
    }
}

fn key_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Strip every non-digit character from `raw` and accept the result only if it is a DNI.
#[must_use]
pub fn normalize_key(raw: &str) -> RequestKey {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == DNI_LENGTH {
        RequestKey::Valid(digits)
    } else {
        RequestKey::Invalid(digits)
    }
}

/// Error details of a failed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Description of the failure
    pub message: String,
}

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupData {
    /// Whether the DNI is known
    pub valid: bool,
    /// Normalized DNI, possibly empty
    pub dni: String,
    /// Record fields, present only when the DNI is known
    #[serde(flatten)]
    pub details: Option<PersonDetails>,
}

impl LookupData {
    /// A known DNI and its record
    #[must_use]
    pub fn hit(dni: String, details: PersonDetails) -> Self {
        Self {
            valid: true,
            dni,
            details: Some(details),
        }
    }

    /// An unknown or invalid DNI
    #[must_use]
    pub fn miss(dni: String) -> Self {
        Self {
            valid: false,
            dni,
            details: None,
        }
    }
}

/// Body of a lookup reply: `{ok, data, error?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Whether the lookup could be performed
    pub ok: bool,
    /// Lookup outcome. Serialized as `null` when the lookup failed.
    pub data: Option<LookupData>,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl LookupResponse {
    /// A lookup that was performed
    #[must_use]
    pub fn success(data: LookupData) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// A lookup that could not be performed
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }

    /// Serialize to a JSON body.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Json`] if serialization fails.
    pub fn to_body(&self) -> Result<Bytes, EnvelopeError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Decode a reply body on the calling side.
///
/// A body that is not JSON decodes to `{ok:false, error:{message:"decode_error"}}`.
#[must_use]
pub fn decode_reply(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| json!({"ok": false, "error": {"message": "decode_error"}}))
}

/// The `ok` flag of a decoded reply. Missing or non-boolean means failure.
#[must_use]
pub fn reply_ok(reply: &Value) -> bool {
    reply.get("ok").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use reniec_mqtt::control_packet::QoS;
    use test_case::test_case;

    use super::*;

    #[test_case(r#"{"dni":"12345678"}"#; "top level")]
    #[test_case(r#"{"data":{"dni":"12345678"}}"#; "under data")]
    #[test_case(r#"{"payload":{"dni":"12345678"}}"#; "under payload")]
    #[test_case(r#"{"payload":{"documento":"12345678"}}"#; "alternate name under payload")]
    #[test_case(r#"{"dni":12345678}"#; "integer")]
    #[test_case(r#"{"dni":"1234-5678"}"#; "separators stripped")]
    #[test_case(r#"{"dni":"","data":{"dni":"12345678"}}"#; "empty value skipped")]
    #[test_case(r#"{"dni":null,"payload":{"documento":" 12.345.678 "}}"#; "null value skipped")]
    fn valid_key_shapes(body: &str) {
        assert_eq!(
            request_key(body.as_bytes()),
            RequestKey::Valid("12345678".to_string())
        );
    }

    #[test_case(r#"{"dni":"1234"}"#, "1234"; "too short")]
    #[test_case(r#"{"dni":"123456789"}"#, "123456789"; "too long")]
    #[test_case(r#"{"dni":"ABCDEFGH"}"#, ""; "no digits")]
    #[test_case(r#"{"data":{"dni":"12-34"}}"#, "1234"; "nested non digits")]
    fn invalid_keys(body: &str, normalized: &str) {
        assert_eq!(
            request_key(body.as_bytes()),
            RequestKey::Invalid(normalized.to_string())
        );
    }

    #[test_case(b"not json"; "not json")]
    #[test_case(b"[]"; "array")]
    #[test_case(b"{}"; "empty object")]
    #[test_case(br#"{"dni":true}"#; "boolean key")]
    #[test_case(br#"{"dni":1.5}"#; "float key")]
    #[test_case(br#"{"data":"12345678"}"#; "data not an object")]
    #[test_case(br#"{"payload":{"ruc":"12345678"}}"#; "unknown field")]
    fn missing_keys(body: &[u8]) {
        assert_eq!(request_key(body), RequestKey::Missing);
    }

    #[test]
    fn hit_serializes_merged_record() {
        let details = PersonDetails {
            nombres: "LUIS ALBERTO".to_string(),
            apellido_pat: "TORRES".to_string(),
            apellido_mat: "MENDOZA".to_string(),
            fecha_naci: NaiveDate::from_ymd_opt(1992, 11, 5),
            sexo: Some("M".to_string()),
            direccion: None,
            estado_civil: None,
            lugar_nacimiento: None,
        };
        let response = LookupResponse::success(LookupData::hit("12345678".to_string(), details));
        let value: Value = serde_json::from_slice(&response.to_body().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "ok": true,
                "data": {
                    "valid": true,
                    "dni": "12345678",
                    "nombres": "LUIS ALBERTO",
                    "apellidoPat": "TORRES",
                    "apellidoMat": "MENDOZA",
                    "fecha_naci": "1992-11-05",
                    "sexo": "M"
                }
            })
        );
    }

    #[test]
    fn miss_and_failure_serialization() {
        let miss = LookupResponse::success(LookupData::miss("99999999".to_string()));
        let value: Value = serde_json::from_slice(&miss.to_body().unwrap()).unwrap();
        assert_eq!(value, json!({"ok": true, "data": {"valid": false, "dni": "99999999"}}));

        let failure = LookupResponse::failure("connection reset");
        let value: Value = serde_json::from_slice(&failure.to_body().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"ok": false, "data": null, "error": {"message": "connection reset"}})
        );
    }

    #[test]
    fn miss_deserializes_without_details() {
        let response: LookupResponse =
            serde_json::from_str(r#"{"ok":true,"data":{"valid":false,"dni":""}}"#).unwrap();
        assert_eq!(response, LookupResponse::success(LookupData::miss(String::new())));
    }

    #[test]
    fn decode_reply_fallback() {
        let reply = decode_reply(b"<html>");
        assert!(!reply_ok(&reply));
        assert_eq!(reply["error"]["message"], "decode_error");
        assert!(reply_ok(&decode_reply(br#"{"ok":true}"#)));
        assert!(!reply_ok(&decode_reply(br#"{"ok":"yes"}"#)));
    }

    #[test]
    fn envelope_from_publish() {
        let request = Envelope::request(
            "corr-0123456789".to_string(),
            "clients/load-client-0/reply".to_string(),
            Bytes::from_static(b"{}"),
        );
        let publish = Publish::new(
            "rabbit_exchange/reniec_operation",
            QoS::AtLeastOnce,
            request.body.clone(),
            request.to_properties(),
        );
        let received = Envelope::from_publish(&publish);
        assert_eq!(received, request);

        let reply = Envelope::reply_to(&received, Bytes::from_static(b"{\"ok\":true}"));
        assert_eq!(reply.correlation_token.as_deref(), Some("corr-0123456789"));
        assert_eq!(reply.content_kind.as_deref(), Some(CONTENT_TYPE_JSON));
        assert!(reply.to_properties().response_topic.is_none());
    }

    #[test]
    fn non_utf8_token_and_empty_reply_destination_are_absent() {
        let properties = PublishProperties {
            correlation_data: Some(Bytes::from_static(&[0xff, 0xfe])),
            response_topic: Some(String::new()),
            ..Default::default()
        };
        let publish = Publish::new("t", QoS::AtLeastOnce, Bytes::new(), properties);
        let envelope = Envelope::from_publish(&publish);
        assert!(envelope.correlation_token.is_none());
        assert!(envelope.reply_destination.is_none());
    }
}
