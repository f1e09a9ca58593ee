//! Wire protocol for the dispatch socket.
//!
//! Every frame is `{ "type": string, "payload": object }`. Inbound frames are
//! decoded in two steps: the envelope first, then the payload for the given
//! type, so an unknown type and a bad payload produce distinct errors.
//! Payload field names are camelCase on the wire; snake_case aliases are
//! accepted for the identifiers clients most often get wrong.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::CoreError;
use crate::jobs::{Job, JobKind, JobStatus, Priority};
use crate::roles::Role;
use crate::types::{ConnectionId, JobId, Timestamp};

/// Maximum chat message length in characters.
pub const MAX_CHAT_LEN: u64 = 2000;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register(RegisterPayload),
    Subscribe(ChannelPayload),
    Unsubscribe(ChannelPayload),
    Emergency(EmergencyPayload),
    JobAccept(JobAcceptPayload),
    JobComplete(JobCompletePayload),
    LocationUpdate(LocationUpdatePayload),
    Chat(ChatPayload),
    Ping,
}

impl ClientMessage {
    /// Decode and validate a text frame.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let envelope: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Invalid message format: {e}")))?;

        let message = match envelope.kind.as_str() {
            "register" => ClientMessage::Register(payload(&envelope)?),
            "subscribe" => ClientMessage::Subscribe(payload(&envelope)?),
            "unsubscribe" => ClientMessage::Unsubscribe(payload(&envelope)?),
            "emergency" => ClientMessage::Emergency(payload(&envelope)?),
            "job_accept" => ClientMessage::JobAccept(payload(&envelope)?),
            "job_complete" => ClientMessage::JobComplete(payload(&envelope)?),
            "location_update" => ClientMessage::LocationUpdate(payload(&envelope)?),
            "chat" => ClientMessage::Chat(payload(&envelope)?),
            "ping" => ClientMessage::Ping,
            other => {
                return Err(CoreError::Validation(format!(
                    "Unknown message type '{other}'"
                )))
            }
        };
        Ok(message)
    }

    /// Wire name of the message type (for logs and metrics).
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register(_) => "register",
            ClientMessage::Subscribe(_) => "subscribe",
            ClientMessage::Unsubscribe(_) => "unsubscribe",
            ClientMessage::Emergency(_) => "emergency",
            ClientMessage::JobAccept(_) => "job_accept",
            ClientMessage::JobComplete(_) => "job_complete",
            ClientMessage::LocationUpdate(_) => "location_update",
            ClientMessage::Chat(_) => "chat",
            ClientMessage::Ping => "ping",
        }
    }
}

fn payload<T>(envelope: &RawEnvelope) -> Result<T, CoreError>
where
    T: for<'de> Deserialize<'de> + Validate,
{
    let value = match &envelope.payload {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    let parsed: T = serde_json::from_value(value).map_err(|e| {
        CoreError::Validation(format!("Invalid '{}' payload: {e}", envelope.kind))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

/// Free-form registration metadata.
///
/// The named fields are the ones the dispatch core reads; anything else the
/// client sends is kept in `extra` and echoed to admin tooling untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[validate(length(max = 128))]
    pub session_id: Option<String>,
    /// Stable contractor identity from the contractor directory.
    #[validate(length(min = 1, max = 128))]
    pub contractor_id: Option<String>,
    #[validate(length(max = 200))]
    pub business_name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub area: Option<String>,
    #[validate(length(max = 200))]
    pub location: Option<String>,
    #[serde(default)]
    #[validate(length(max = 32))]
    pub services: Vec<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct RegisterPayload {
    #[serde(alias = "type")]
    pub role: Role,
    #[serde(default)]
    #[validate(nested)]
    pub metadata: ConnectionMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct ChannelPayload {
    #[validate(length(min = 1, max = 128))]
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Contact {
    #[validate(length(max = 200))]
    pub name: Option<String>,
    #[validate(length(min = 3, max = 32))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyPayload {
    #[serde(rename = "type", alias = "emergencyType", alias = "emergency_type")]
    #[validate(length(min = 1, max = 64))]
    pub emergency_type: String,
    #[validate(length(min = 1, max = 100))]
    pub area: Option<String>,
    #[validate(length(min = 1, max = 300))]
    pub location: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(nested)]
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JobAcceptPayload {
    #[serde(alias = "job_id")]
    pub job_id: JobId,
    #[validate(length(max = 64))]
    pub estimated_arrival: Option<String>,
    #[validate(length(max = 32))]
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletePayload {
    #[serde(alias = "job_id")]
    pub job_id: JobId,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(range(min = 0.0))]
    pub invoice_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    #[validate(length(min = 1, max = 300))]
    pub location: String,
    #[serde(alias = "suburb")]
    #[validate(length(min = 1, max = 100))]
    pub area: Option<String>,
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: Option<f64>,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(alias = "job_id")]
    pub job_id: JobId,
    #[validate(length(min = 1, max = 2000))]
    pub content: String,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Server-originated frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Connected {
        connection_id: ConnectionId,
        server: String,
    },
    Registered {
        connection_id: ConnectionId,
        role: Role,
        channels: Vec<String>,
    },
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    EmergencyReceived {
        job_id: JobId,
        status: JobStatus,
        message: String,
        estimated_response: String,
    },
    JobAvailable {
        job_id: JobId,
        kind: JobKind,
        priority: Priority,
        area: String,
        details: Value,
        retry_count: u32,
    },
    JobAccepted {
        job_id: JobId,
        details: Value,
    },
    JobRejected {
        job_id: JobId,
        reason: String,
    },
    JobTaken {
        job_id: JobId,
    },
    ContractorAssigned {
        job_id: JobId,
        contractor_id: String,
        business_name: Option<String>,
        estimated_arrival: String,
        phone: Option<String>,
    },
    JobStatusUpdate {
        job_id: JobId,
        status: JobStatus,
        contractor_id: Option<String>,
        notes: Option<String>,
    },
    ContractorAvailable {
        contractor_id: String,
        business_name: Option<String>,
        location: String,
        area: String,
    },
    ChatMessage {
        message_id: String,
        job_id: JobId,
        from: ConnectionId,
        content: String,
        sent_at: Timestamp,
    },
    MessageSent {
        message_id: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Offer notification for a waiting job.
    pub fn job_available(job: &Job) -> Self {
        ServerMessage::JobAvailable {
            job_id: job.id,
            kind: job.kind,
            priority: job.priority,
            area: job.area.clone(),
            details: job.payload.clone(),
            retry_count: job.retry_count,
        }
    }

    /// Error frame for a domain error.
    pub fn error(err: &CoreError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Error frame with an explicit code.
    pub fn error_with_code(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::EmergencyReceived { .. } => "emergency_received",
            ServerMessage::JobAvailable { .. } => "job_available",
            ServerMessage::JobAccepted { .. } => "job_accepted",
            ServerMessage::JobRejected { .. } => "job_rejected",
            ServerMessage::JobTaken { .. } => "job_taken",
            ServerMessage::ContractorAssigned { .. } => "contractor_assigned",
            ServerMessage::JobStatusUpdate { .. } => "job_status_update",
            ServerMessage::ContractorAvailable { .. } => "contractor_available",
            ServerMessage::ChatMessage { .. } => "chat_message",
            ServerMessage::MessageSent { .. } => "message_sent",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
