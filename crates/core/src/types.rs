/// Connection identifiers are opaque, process-unique strings (UUID v4 text).
pub type ConnectionId = String;

/// Jobs are identified by globally unique UUIDs generated at creation.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
