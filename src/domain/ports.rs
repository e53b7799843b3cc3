//! Domain Ports - Core trait definitions for the reconciler
//!
//! These traits define the boundary between the reconciliation logic and the
//! storage controller's REST API. Gateways implement [`BackendGateway`] to
//! provide concrete transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A decoded JSON object as exchanged with the storage controller
pub type Record = serde_json::Map<String, Value>;

// =============================================================================
// Resource Kinds
// =============================================================================

/// Kinds of objects known to the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Svm,
    Volume,
    Snapshot,
    Snapmirror,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Svm => write!(f, "svm"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Snapshot => write!(f, "snapshot"),
            ResourceKind::Snapmirror => write!(f, "snapmirror"),
        }
    }
}

// =============================================================================
// Identity and References
// =============================================================================

/// Backend-assigned identifier of a managed object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Fail with `InvalidState` unless the identity is usable as a key
    pub fn require(&self, kind: ResourceKind, operation: &str) -> Result<&Self> {
        if self.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} {} requires an id, but the id is empty",
                kind, operation
            )));
        }
        Ok(self)
    }

    /// Extract the `uuid` field of a backend record
    pub fn from_record(record: &Record) -> Option<Self> {
        record
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A display name and, once resolved, the identifier it refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameReference {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Identity>,
}

impl NameReference {
    pub fn unresolved(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
        }
    }

    pub fn resolved(kind: ResourceKind, name: impl Into<String>, id: Identity) -> Self {
        Self {
            kind,
            name: name.into(),
            id: Some(id),
        }
    }

    /// The resolved identifier; an unresolved reference is never "absent"
    pub fn id(&self) -> Result<&Identity> {
        self.id.as_ref().ok_or_else(|| {
            Error::InvalidState(format!(
                "{} reference '{}' used before it was resolved",
                self.kind, self.name
            ))
        })
    }
}

// =============================================================================
// Query Builder
// =============================================================================

/// Ordered key/value pairs appended to a request URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    params: IndexMap<String, String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a parameter
    pub fn add(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Request the created/updated records in the response body
    pub fn return_records(self) -> Self {
        self.add("return_records", "true")
    }

    /// Restrict the returned fields
    pub fn fields(self, fields: &[&str]) -> Self {
        self.add("fields", fields.join(","))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `k1=v1&k2=v2` with URL-encoded values
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Response body of a create call made with `return_records=true`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsResponse {
    #[serde(default)]
    pub num_records: usize,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl RecordsResponse {
    /// Identity of the first returned record
    pub fn first_identity(&self) -> Option<Identity> {
        self.records.first().and_then(Identity::from_record)
    }
}

// =============================================================================
// Record Helpers
// =============================================================================

/// Look up a dotted path (`source.cluster.name`) in a record
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// String value at a dotted path, if present and a string
pub fn lookup_str<'a>(record: &'a Record, path: &str) -> Option<&'a str> {
    lookup(record, path).and_then(Value::as_str)
}

/// `{"name": <name>}`, the shape used for by-name references in payloads
pub fn name_object(name: &str) -> Value {
    serde_json::json!({ "name": name })
}

// =============================================================================
// Backend Gateway Port
// =============================================================================

/// Port for calls against the storage controller's REST API.
///
/// Paths are relative to the API root (`svm/svms`, `snapmirror/relationships/{id}`).
/// Non-success statuses surface as [`Error::Backend`], network failures as
/// [`Error::Transport`].
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// GET expecting zero or one record. Absence is `Ok(None)`.
    async fn get(&self, path: &str, query: &Query) -> Result<Option<Record>>;

    /// GET a collection
    async fn list(&self, path: &str, query: &Query) -> Result<Vec<Record>>;

    /// POST a new object
    async fn create(&self, path: &str, query: &Query, body: &Record) -> Result<RecordsResponse>;

    /// PATCH an existing object
    async fn update(&self, path: &str, query: &Query, body: &Record) -> Result<Option<Record>>;

    /// DELETE an object
    async fn delete(&self, path: &str, query: &Query) -> Result<()>;

    /// Gateway name, for logs
    fn name(&self) -> &str;
}

pub type BackendGatewayRef = Arc<dyn BackendGateway>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(format!("{}", ResourceKind::Svm), "svm");
        assert_eq!(format!("{}", ResourceKind::Snapmirror), "snapmirror");
    }

    #[test]
    fn test_query_string_encoding() {
        let query = Query::new()
            .add("name", "vol 1")
            .add("svm.uuid", "a&b")
            .return_records();
        assert_eq!(
            query.to_query_string(),
            "name=vol%201&svm.uuid=a%26b&return_records=true"
        );
        assert_eq!(query.get("return_records"), Some("true"));
    }

    #[test]
    fn test_empty_identity_is_invalid_state() {
        let id = Identity::new("");
        let err = id.require(ResourceKind::Snapshot, "delete").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(Identity::new("abc").require(ResourceKind::Svm, "read").is_ok());
    }

    #[test]
    fn test_unresolved_reference() {
        let reference = NameReference::unresolved(ResourceKind::Volume, "v1");
        assert!(matches!(reference.id(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_lookup_dotted_path() {
        let record = json!({"source": {"path": "svm1:v1", "cluster": {"name": "c1"}}});
        let record = record.as_object().unwrap();
        assert_eq!(lookup_str(record, "source.cluster.name"), Some("c1"));
        assert_eq!(lookup_str(record, "destination.path"), None);
    }
}
