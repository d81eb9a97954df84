use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identity of one accepted simulation request.
///
/// Generated exactly once per request and never reassigned. It is the only
/// key shared by the scenario store, the cancellation registry, the
/// progress hub and the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh, time-ordered identifier (UUID v7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse a caller-supplied identifier.
    ///
    /// Malformed input yields `None` rather than an error: callers treat an
    /// unparseable id exactly like an unknown one.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_time_ordered() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a < b, "v7 ids generated in sequence must sort in order");
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn parse_accepts_canonical_uuid() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(JobId::parse(""), None);
        assert_eq!(JobId::parse("not-a-uuid"), None);
        assert_eq!(JobId::parse("12345"), None);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = JobId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
