//! Channel naming and role-based access rules.
//!
//! Channel names are plain strings on the wire. [`ChannelKind::parse`]
//! classifies a name and [`authorize_subscribe`] decides whether a role may
//! join it through a `subscribe` message. Server-side subscriptions (the
//! auto-subscriptions made on `register` and the `job:<id>` channels) bypass
//! the subscribe check.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::roles::Role;
use crate::types::JobId;

pub const CHANNEL_EMERGENCY_UPDATES: &str = "emergency-updates";
pub const CHANNEL_CLIENTS: &str = "clients";
pub const CHANNEL_CONTRACTORS: &str = "contractors";
pub const CHANNEL_ADMIN: &str = "admin";

const AREA_PREFIX: &str = "area:";
const SERVICE_PREFIX: &str = "service:";
const LOCATION_PREFIX: &str = "location:";
const JOB_PREFIX: &str = "job:";

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_NAME_LEN: usize = 128;

static CHANNEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]+$").expect("valid regex"));

/// Classified channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    EmergencyUpdates,
    Clients,
    Contractors,
    Admin,
    Area(String),
    Service(String),
    Location(String),
    Job(String),
}

impl ChannelKind {
    /// Validate and classify a channel name.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "Channel name must be 1-{MAX_CHANNEL_NAME_LEN} characters"
            )));
        }
        if !CHANNEL_NAME_RE.is_match(name) {
            return Err(CoreError::Validation(format!(
                "Channel name '{name}' contains invalid characters"
            )));
        }

        let kind = match name {
            CHANNEL_EMERGENCY_UPDATES => ChannelKind::EmergencyUpdates,
            CHANNEL_CLIENTS => ChannelKind::Clients,
            CHANNEL_CONTRACTORS => ChannelKind::Contractors,
            CHANNEL_ADMIN => ChannelKind::Admin,
            _ => {
                if let Some(rest) = name.strip_prefix(AREA_PREFIX) {
                    ChannelKind::Area(normalize_scope(&scoped_value(name, rest)?))
                } else if let Some(rest) = name.strip_prefix(SERVICE_PREFIX) {
                    ChannelKind::Service(normalize_scope(&scoped_value(name, rest)?))
                } else if let Some(rest) = name.strip_prefix(LOCATION_PREFIX) {
                    ChannelKind::Location(normalize_scope(&scoped_value(name, rest)?))
                } else if let Some(rest) = name.strip_prefix(JOB_PREFIX) {
                    ChannelKind::Job(scoped_value(name, rest)?)
                } else {
                    return Err(CoreError::Validation(format!("Unknown channel '{name}'")));
                }
            }
        };
        Ok(kind)
    }

    /// Canonical channel name. Area, service and location scopes come back
    /// normalised, so `area:Brisbane-CBD` and `area:brisbane-cbd` name the
    /// same channel.
    pub fn name(&self) -> String {
        match self {
            ChannelKind::EmergencyUpdates => CHANNEL_EMERGENCY_UPDATES.to_string(),
            ChannelKind::Clients => CHANNEL_CLIENTS.to_string(),
            ChannelKind::Contractors => CHANNEL_CONTRACTORS.to_string(),
            ChannelKind::Admin => CHANNEL_ADMIN.to_string(),
            ChannelKind::Area(scope) => format!("{AREA_PREFIX}{scope}"),
            ChannelKind::Service(scope) => format!("{SERVICE_PREFIX}{scope}"),
            ChannelKind::Location(scope) => format!("{LOCATION_PREFIX}{scope}"),
            ChannelKind::Job(id) => format!("{JOB_PREFIX}{id}"),
        }
    }

    /// Roles allowed to join this channel via a `subscribe` message.
    fn allowed_roles(&self) -> &'static [Role] {
        match self {
            ChannelKind::EmergencyUpdates | ChannelKind::Location(_) => &Role::ALL,
            ChannelKind::Clients => &[Role::Client, Role::Admin],
            ChannelKind::Contractors | ChannelKind::Area(_) | ChannelKind::Service(_) => {
                &[Role::Contractor, Role::Admin]
            }
            ChannelKind::Admin | ChannelKind::Job(_) => &[Role::Admin],
        }
    }
}

fn scoped_value(name: &str, rest: &str) -> Result<String, CoreError> {
    if rest.is_empty() {
        return Err(CoreError::Validation(format!(
            "Channel '{name}' is missing its scope"
        )));
    }
    Ok(rest.to_string())
}

/// Check that `role` may subscribe to `channel` on request.
///
/// Returns the classified channel on success so callers do not parse twice.
pub fn authorize_subscribe(role: Role, channel: &str) -> Result<ChannelKind, CoreError> {
    let kind = ChannelKind::parse(channel)?;
    if kind.allowed_roles().contains(&role) {
        Ok(kind)
    } else {
        Err(CoreError::Forbidden(format!(
            "Role '{role}' may not subscribe to '{channel}'"
        )))
    }
}

/// Normalise a free-form area or suburb into a channel scope.
///
/// `"Brisbane CBD"` becomes `"brisbane-cbd"`.
pub fn normalize_scope(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

pub fn area_channel(area: &str) -> String {
    format!("{AREA_PREFIX}{}", normalize_scope(area))
}

pub fn service_channel(service: &str) -> String {
    format!("{SERVICE_PREFIX}{}", normalize_scope(service))
}

pub fn location_channel(location: &str) -> String {
    format!("{LOCATION_PREFIX}{}", normalize_scope(location))
}

pub fn job_channel(job_id: JobId) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

/// Whether the channel is scoped to a geographic area.
pub fn is_area_channel(channel: &str) -> bool {
    channel.starts_with(AREA_PREFIX)
}
