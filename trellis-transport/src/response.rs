//! Transport response and call details.

use crate::audit::Audit;
use crate::error::{PipelineError, TransportError};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// What happened during one API call.
#[derive(Debug, Clone)]
pub struct ApiCallDetails {
    /// The call succeeded.
    pub success: bool,
    /// Status of the last response, if any.
    pub status: Option<StatusCode>,
    /// HTTP method.
    pub method: Method,
    /// URI of the last attempt, if any.
    pub uri: Option<Url>,
    /// Ordered pings, sniffs and calls.
    pub audit_trail: Vec<Audit>,
    /// Deprecation warnings from `Warning` headers.
    pub deprecation_warnings: Vec<String>,
    /// Why the call failed, when it did.
    pub original_error: Option<PipelineError>,
}

impl ApiCallDetails {
    /// Human readable summary of the call.
    pub fn debug_information(&self) -> String {
        match &self.original_error {
            Some(error) => error.debug_information(),
            None => {
                let mut out = format!(
                    "# Successful ({}) low level call on {} {}\n",
                    self.status.map(|s| s.as_u16()).unwrap_or_default(),
                    self.method,
                    self.uri.as_ref().map(Url::as_str).unwrap_or("-"),
                );
                out.push_str("# Audit trail of this API call:\n");
                for (i, audit) in self.audit_trail.iter().enumerate() {
                    out.push_str(&format!(" - [{}] {}\n", i + 1, audit));
                }
                out
            }
        }
    }
}

/// Response of an API call, valid or not.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    details: ApiCallDetails,
    headers: HeaderMap,
    body: Bytes,
}

impl TransportResponse {
    pub(crate) fn new(details: ApiCallDetails, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            details,
            headers,
            body,
        }
    }

    /// Whether the call succeeded.
    pub fn is_valid(&self) -> bool {
        self.details.success
    }

    /// Status of the last response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.details.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Call details.
    pub fn details(&self) -> &ApiCallDetails {
        &self.details
    }

    /// Ordered pings, sniffs and calls.
    pub fn audit_trail(&self) -> &[Audit] {
        &self.details.audit_trail
    }

    /// Why the call failed, when it did.
    pub fn original_error(&self) -> Option<&PipelineError> {
        self.details.original_error.as_ref()
    }

    /// Human readable summary of the call.
    pub fn debug_information(&self) -> String {
        self.details.debug_information()
    }
}

/// Deprecation warnings carried in `Warning` headers.
pub(crate) fn deprecation_warnings(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::WARNING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::error::PipelineFailure;
    use chrono::Utc;
    use http::HeaderValue;
    use serde_json::Value;

    fn details(success: bool) -> ApiCallDetails {
        ApiCallDetails {
            success,
            status: Some(StatusCode::OK),
            method: Method::GET,
            uri: Url::parse("http://localhost:9200/_cluster/health").ok(),
            audit_trail: vec![Audit::new(AuditEvent::HealthyResponse, None, Utc::now())],
            deprecation_warnings: Vec::new(),
            original_error: (!success).then(|| PipelineError::new(PipelineFailure::BadResponse)),
        }
    }

    #[test]
    fn test_json_body() {
        let response = TransportResponse::new(
            details(true),
            HeaderMap::new(),
            Bytes::from_static(b"{\"status\":\"green\"}"),
        );
        let body: Value = response.json().unwrap();
        assert_eq!(body["status"], "green");
        assert!(response.is_valid());
        assert!(response.debug_information().contains("Successful (200)"));
    }

    #[test]
    fn test_invalid_response_explains_itself() {
        let response = TransportResponse::new(details(false), HeaderMap::new(), Bytes::new());
        assert!(!response.is_valid());
        assert_eq!(
            response.original_error().map(|e| e.failure),
            Some(PipelineFailure::BadResponse)
        );
        assert!(response.json::<Value>().is_err());
    }

    #[test]
    fn test_deprecation_warnings() {
        let mut headers = HeaderMap::new();
        headers.append(http::header::WARNING, HeaderValue::from_static("299 OpenSearch \"old\""));
        headers.append(http::header::WARNING, HeaderValue::from_static("299 OpenSearch \"older\""));
        assert_eq!(deprecation_warnings(&headers).len(), 2);
    }
}
