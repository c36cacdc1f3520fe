use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Last known position of one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationRecord {
    pub username: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Payload of the join and leave notices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub username: String,
    pub message: String,
}

impl Notice {
    pub fn connected(username: &str) -> Self {
        Self {
            username: username.to_string(),
            message: format!("{username} connected"),
        }
    }

    pub fn disconnected(username: &str) -> Self {
        Self {
            username: username.to_string(),
            message: format!("{username} disconnected"),
        }
    }
}

/// Every frame on the wire is `{"type": <kind>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    LocationUpdate(LocationRecord),
    UserConnected(Notice),
    UserDisconnected(Notice),
    CurrentLocations(BTreeMap<String, LocationRecord>),
    /// A kind this build does not know about, kept verbatim.
    Unknown { kind: String, data: Value },
}

const LOCATION_UPDATE: &str = "location_update";
const USER_CONNECTED: &str = "user_connected";
const USER_DISCONNECTED: &str = "user_disconnected";
const CURRENT_LOCATIONS: &str = "current_locations";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct OutgoingFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn kind(&self) -> &str {
        match self {
            Envelope::LocationUpdate(_) => LOCATION_UPDATE,
            Envelope::UserConnected(_) => USER_CONNECTED,
            Envelope::UserDisconnected(_) => USER_DISCONNECTED,
            Envelope::CurrentLocations(_) => CURRENT_LOCATIONS,
            Envelope::Unknown { kind, .. } => kind,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        let encoded = match self {
            Envelope::LocationUpdate(record) => encode_frame(self.kind(), record),
            Envelope::UserConnected(notice) | Envelope::UserDisconnected(notice) => {
                encode_frame(self.kind(), notice)
            }
            Envelope::CurrentLocations(locations) => encode_frame(self.kind(), locations),
            Envelope::Unknown { kind, data } => encode_frame(kind, data),
        };
        encoded.map_err(|source| CodecError::Encode {
            kind: self.kind().to_string(),
            source,
        })
    }

    /// Decodes in two steps so callers can tell a broken frame from a broken
    /// payload under a kind we understand.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let IncomingFrame { kind, data } =
            serde_json::from_str(text).map_err(CodecError::Envelope)?;

        let envelope = match kind.as_str() {
            LOCATION_UPDATE => Envelope::LocationUpdate(decode_payload(LOCATION_UPDATE, data)?),
            USER_CONNECTED => Envelope::UserConnected(decode_payload(USER_CONNECTED, data)?),
            USER_DISCONNECTED => {
                Envelope::UserDisconnected(decode_payload(USER_DISCONNECTED, data)?)
            }
            CURRENT_LOCATIONS => {
                Envelope::CurrentLocations(decode_payload(CURRENT_LOCATIONS, data)?)
            }
            _ => Envelope::Unknown { kind, data },
        };
        Ok(envelope)
    }
}

fn encode_frame<T: Serialize>(kind: &str, data: &T) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingFrame { kind, data })
}

fn decode_payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|source| CodecError::Payload { kind, source })
}
