use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Envelope for a replication event.
///
/// This is the unit a broker carries between services.
///
/// Notes:
/// - On the wire the body is `{"data": <payload>, "timestamp": "<ISO-8601 UTC>"}`.
/// - The **routing key is not part of the body**; brokers carry it out-of-band
///   (topic routing key / stream name) and hand it back on delivery.
/// - Envelopes are immutable once built; there are no setters.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    routing_key: String,
    data: JsonValue,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode envelope body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct WireBody {
    data: JsonValue,
    #[serde(serialize_with = "serialize_timestamp", deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap a payload, stamping it with the current UTC time.
    pub fn new(routing_key: impl Into<String>, data: JsonValue) -> Self {
        Self::with_timestamp(routing_key, data, Utc::now())
    }

    pub fn with_timestamp(routing_key: impl Into<String>, data: JsonValue, timestamp: DateTime<Utc>) -> Self {
        Self {
            routing_key: routing_key.into(),
            data,
            timestamp,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }

    /// Serialize the message body (routing key excluded).
    pub fn to_body(&self) -> Result<Vec<u8>, WireError> {
        let body = WireBody {
            data: self.data.clone(),
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&body).map_err(WireError::Encode)
    }

    /// Rebuild an envelope from a delivered body and its out-of-band routing key.
    pub fn from_body(routing_key: impl Into<String>, body: &[u8]) -> Result<Self, WireError> {
        let wire: WireBody = serde_json::from_slice(body).map_err(WireError::Decode)?;
        Ok(Self {
            routing_key: routing_key.into(),
            data: wire.data,
            timestamp: wire.timestamp,
        })
    }
}

fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Accepts RFC 3339 timestamps and offset-less ISO-8601 ones.
///
/// Producers that stamp with a naive UTC datetime emit no offset; such values
/// are read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn body_carries_data_and_timestamp_only() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 0).unwrap();
        let env = EventEnvelope::with_timestamp("book.deleted", json!({"isbn": "123"}), ts);

        let body: JsonValue = serde_json::from_slice(&env.to_body().unwrap()).unwrap();

        assert_eq!(body["data"], json!({"isbn": "123"}));
        assert_eq!(body["timestamp"], "2025-01-01T12:30:00.000000Z");
        assert!(body.get("routing_key").is_none());
    }

    #[test]
    fn routing_key_is_restored_from_delivery() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let env = EventEnvelope::with_timestamp("user.created", json!({"email": "a@x.com"}), ts);
        let decoded = EventEnvelope::from_body("user.created", &env.to_body().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let body = br#"{"data": {"isbn": "1"}, "timestamp": "2024-03-05T10:11:12.345678"}"#;
        let env = EventEnvelope::from_body("book.deleted", body).unwrap();
        assert_eq!(
            env.timestamp(),
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 11, 12).unwrap() + chrono::Duration::microseconds(345_678)
        );
    }

    #[test]
    fn missing_data_is_rejected() {
        let body = br#"{"timestamp": "2024-03-05T10:11:12Z"}"#;
        assert!(EventEnvelope::from_body("book.deleted", body).is_err());
    }
}
