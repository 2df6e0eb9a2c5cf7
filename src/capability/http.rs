use crate::error::CapabilityError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// What the target API answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiReply {
    pub url: String,
    pub status_code: u16,
    /// Parsed JSON, or the raw text as a JSON string when the body is not JSON.
    pub body: Value,
    pub headers: BTreeMap<String, String>,
}

/// HTTP access to the API under test. Any status code is a successful call;
/// only transport faults are errors.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn call(
        &self,
        method: &str,
        target: &str,
        payload: Option<&Value>,
    ) -> Result<ApiReply, CapabilityError> {
        let method = method.trim().to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(CapabilityError::external(format!(
                "unsupported HTTP method '{}'",
                method
            )));
        }
        let url = resolve_target(&self.base_url, target)?;
        let http_method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| CapabilityError::external(e.to_string()))?;

        let mut request = self
            .client
            .request(http_method, url.as_str())
            .timeout(self.timeout);
        if let Some(body) = payload {
            request = request.json(body);
        }

        tracing::debug!(%method, %url, "calling target API");
        let response = request
            .send()
            .await
            .map_err(|e| CapabilityError::external(format!("{} {}: {}", method, url, e)))?;

        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::external(format!("{} {}: {}", method, url, e)))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ApiReply {
            url: url.to_string(),
            status_code,
            body,
            headers,
        })
    }
}

/// Absolute targets pass through; anything else is appended to the base.
pub fn resolve_target(base_url: &str, target: &str) -> Result<url::Url, CapabilityError> {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        return url::Url::parse(target)
            .map_err(|e| CapabilityError::external(format!("invalid URL '{}': {}", target, e)));
    }
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        target.trim_start_matches('/')
    );
    url::Url::parse(&joined)
        .map_err(|e| CapabilityError::external(format!("invalid URL '{}': {}", joined, e)))
}
