//! Backend Gateways
//!
//! Implementations of [`BackendGateway`]:
//! - RestGateway: the storage controller's REST API over HTTPS
//! - MemoryGateway: an in-process simulation of the controller for tests

pub mod memory;
pub mod rest;

pub use memory::*;
pub use rest::*;

use crate::config::ConnectionProfile;
use crate::domain::ports::{BackendGateway, Record};
use crate::error::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

/// Factory for creating gateways from connection profiles
pub struct GatewayFactory;

impl GatewayFactory {
    /// Create a REST gateway for a profile
    pub fn create(profile: &ConnectionProfile) -> Result<Arc<dyn BackendGateway>> {
        Ok(Arc::new(RestGateway::new(profile.clone())?))
    }
}

/// Render a controller error as `"<message> (code <code>)"`.
///
/// Callers pattern-match on the numeric code, so it is kept in the text.
pub fn format_backend_message(message: &str, code: Option<&str>) -> String {
    match code {
        Some(code) if !code.is_empty() => format!("{} (code {})", message, code),
        _ => message.to_string(),
    }
}

/// Extract the message of a controller error body:
/// `{"error": {"message": "...", "code": "6619337"}}`
pub fn error_message_from_body(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    match error {
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let code = match error.get("code") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            format_backend_message(message, code.as_deref())
        }
        None if body.trim().is_empty() => "empty response".to_string(),
        None => body.trim().to_string(),
    }
}

/// Split a decoded response into records.
///
/// Collection responses carry `records`; by-id responses are the record itself.
pub fn records_from_value(operation: &str, path: &str, value: Value) -> Result<Vec<Record>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(mut object) => match object.remove("records") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(record) => Ok(record),
                    other => Err(Error::backend(
                        operation,
                        path,
                        200,
                        format!("expected a record object, got {}", other),
                    )),
                })
                .collect(),
            Some(other) => Err(Error::backend(
                operation,
                path,
                200,
                format!("expected a records array, got {}", other),
            )),
            None => Ok(vec![object]),
        },
        other => Err(Error::backend(
            operation,
            path,
            200,
            format!("unexpected response body {}", other),
        )),
    }
}

/// Reduce a list to zero or one record
pub fn nil_or_one(operation: &str, path: &str, mut records: Vec<Record>) -> Result<Option<Record>> {
    match records.len() {
        0 => Ok(None),
        1 => Ok(records.pop()),
        n => Err(Error::backend(
            operation,
            path,
            200,
            format!("expected zero or one record, got {}", n),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_from_body() {
        let body = r#"{"error": {"message": "entry doesn't exist", "code": "6619337", "target": "uuid"}}"#;
        assert_eq!(
            error_message_from_body(body),
            "entry doesn't exist (code 6619337)"
        );
        assert_eq!(error_message_from_body(""), "empty response");
        assert_eq!(error_message_from_body("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_records_from_value() {
        let collection = json!({"num_records": 2, "records": [{"uuid": "a"}, {"uuid": "b"}]});
        assert_eq!(records_from_value("GET", "svm/svms", collection).unwrap().len(), 2);

        let single = json!({"uuid": "a", "name": "svm1"});
        let records = records_from_value("GET", "svm/svms/a", single).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "svm1");

        assert!(records_from_value("GET", "x", json!([1, 2])).is_err());
    }

    #[test]
    fn test_nil_or_one() {
        assert!(nil_or_one("GET", "x", vec![]).unwrap().is_none());
        let two = vec![Record::new(), Record::new()];
        assert!(matches!(
            nil_or_one("GET", "x", two),
            Err(Error::Backend { .. })
        ));
    }
}
