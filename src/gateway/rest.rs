//! REST Gateway
//!
//! Talks to the storage controller's REST API (`https://<host>/api/<path>`)
//! with HTTP basic authentication.

use super::{error_message_from_body, nil_or_one, records_from_value};
use crate::config::ConnectionProfile;
use crate::domain::ports::{BackendGateway, Query, Record, RecordsResponse};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};

/// Gateway backed by `reqwest`
pub struct RestGateway {
    profile: ConnectionProfile,
    client: reqwest::Client,
    base_url: String,
}

impl RestGateway {
    /// Create a new REST gateway for a connection profile
    pub fn new(profile: ConnectionProfile) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!profile.validate_certs)
            .timeout(profile.request_timeout())
            .build()?;

        Ok(Self {
            base_url: profile.api_url(),
            profile,
            client,
        })
    }

    /// Build a URL for an API path
    fn url(&self, path: &str, query: &Query) -> String {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.to_query_string());
        }
        url
    }

    /// Send a request and decode the JSON body.
    ///
    /// `Ok(None)` means the controller answered 404.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<&Record>,
    ) -> Result<Option<Value>> {
        let url = self.url(path, query);
        debug!("{} {}", method, url);
        if let Some(body) = body {
            let body = Value::Object(body.clone());
            trace!("request body: {}", body);
        }

        let mut request = self
            .client
            .request(method.clone(), &url)
            .basic_auth(&self.profile.username, Some(&self.profile.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND && method == Method::GET {
            return Ok(None);
        }

        if !status.is_success() {
            return Err(Error::backend(
                method.as_str(),
                path,
                status.as_u16(),
                error_message_from_body(&text),
            ));
        }

        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }

        serde_json::from_str(&text).map(Some).map_err(|e| {
            Error::backend(
                method.as_str(),
                path,
                status.as_u16(),
                format!("failed to decode response: {}", e),
            )
        })
    }
}

#[async_trait]
impl BackendGateway for RestGateway {
    async fn get(&self, path: &str, query: &Query) -> Result<Option<Record>> {
        let records = self.list(path, query).await?;
        nil_or_one("GET", path, records)
    }

    async fn list(&self, path: &str, query: &Query) -> Result<Vec<Record>> {
        match self.send(Method::GET, path, query, None).await? {
            Some(value) => records_from_value("GET", path, value),
            None => Ok(Vec::new()),
        }
    }

    async fn create(&self, path: &str, query: &Query, body: &Record) -> Result<RecordsResponse> {
        let value = self
            .send(Method::POST, path, query, Some(body))
            .await?
            .unwrap_or(Value::Null);
        if value.is_null() {
            return Ok(RecordsResponse::default());
        }
        serde_json::from_value(value).map_err(|e| {
            Error::backend("POST", path, 201, format!("failed to decode records: {}", e))
        })
    }

    async fn update(&self, path: &str, query: &Query, body: &Record) -> Result<Option<Record>> {
        let value = self.send(Method::PATCH, path, query, Some(body)).await?;
        match value {
            Some(Value::Object(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn delete(&self, path: &str, query: &Query) -> Result<()> {
        self.send(Method::DELETE, path, query, None).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.profile.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            name: "cluster4".into(),
            hostname: "10.0.0.4".into(),
            username: "admin".into(),
            password: "secret".into(),
            validate_certs: false,
            timeout_secs: 10,
        }
    }

    #[test]
    fn test_url_building() {
        let gateway = RestGateway::new(profile()).unwrap();
        let query = Query::new().add("name", "svm1").return_records();
        assert_eq!(
            gateway.url("svm/svms", &query),
            "https://10.0.0.4/api/svm/svms?name=svm1&return_records=true"
        );
        assert_eq!(
            gateway.url("/svm/svms/abc", &Query::new()),
            "https://10.0.0.4/api/svm/svms/abc"
        );
        assert_eq!(gateway.name(), "cluster4");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let mut profile = profile();
        profile.hostname = "http://127.0.0.1:1".into();
        profile.timeout_secs = 2;
        let gateway = RestGateway::new(profile).unwrap();

        let err = gateway.get("svm/svms", &Query::new()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_request_with_body_reaches_transport() {
        let mut profile = profile();
        profile.hostname = "http://127.0.0.1:1".into();
        profile.timeout_secs = 2;
        let gateway = RestGateway::new(profile).unwrap();

        let mut body = Record::new();
        body.insert("name".into(), Value::String("svm1".into()));
        let err = gateway
            .create("svm/svms", &Query::new().return_records(), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
