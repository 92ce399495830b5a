//! Provider API client
//!
//! Pull-based counterpart to the webhook path: when no callback arrives
//! in time, the reconciler queries the provider's task-status endpoint
//! directly. The trait seam lets tests feed canned task states through
//! the identical reconciliation logic.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("tunesync/", env!("CARGO_PKG_VERSION"));

/// Provider statuses that mean the separation will never finish.
const FAILURE_STATUSES: [&str; 4] = [
    "create_task_failed",
    "generate_audio_failed",
    "callback_exception",
    "sensitive_word_error",
];

/// Provider client errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider API key not configured")]
    MissingApiKey,
}

/// Snapshot of one stem separation task as the provider reports it.
#[derive(Debug, Clone)]
pub struct StemTaskStatus {
    pub task_id: String,
    pub code: Option<i64>,
    pub status: Option<String>,
    pub message: Option<String>,
    /// Raw asset payload handed to the normalizer (shape undeclared)
    pub assets: Value,
}

impl StemTaskStatus {
    /// Terminal failure as reported by the provider.
    pub fn is_failure(&self) -> bool {
        if self.code.is_some_and(|c| c != 200) {
            return true;
        }
        self.status
            .as_deref()
            .map(|s| s.to_ascii_lowercase())
            .is_some_and(|s| FAILURE_STATUSES.contains(&s.as_str()))
    }
}

/// Provider API surface consumed by this service.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn query_stem_task(&self, task_id: &str) -> Result<StemTaskStatus, ProviderError>;

    /// Remaining account credits.
    async fn query_balance(&self) -> Result<f64, ProviderError>;
}

/// reqwest-backed provider client.
pub struct ProviderClient {
    http_client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl ProviderClient {
    pub fn new(api_base: String, api_key: Option<String>) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn query_stem_task(&self, task_id: &str) -> Result<StemTaskStatus, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)?;

        let url = format!("{}/api/v1/stems/record-info", self.api_base);
        debug!(task_id, "Querying provider stem task status");

        let response = self
            .http_client
            .get(&url)
            .query(&[("taskId", task_id)])
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(status.as_u16(), body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_stem_task_response(task_id, &body))
    }

    async fn query_balance(&self) -> Result<f64, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)?;

        let url = format!("{}/api/v1/account/balance", self.api_base);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(status.as_u16(), body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        body.get("data")
            .and_then(|d| d.get("balance").or(Some(d)))
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderError::Parse("balance missing from response".to_string()))
    }
}

/// Pull the fields we rely on out of the provider's response envelope:
/// `{code, msg, data: {taskId, successFlag, errorMessage, response}}`.
fn parse_stem_task_response(requested_task_id: &str, body: &Value) -> StemTaskStatus {
    let data = body.get("data").cloned().unwrap_or(Value::Null);

    let task_id = data
        .get("taskId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(requested_task_id)
        .to_string();

    let status = data
        .get("successFlag")
        .and_then(Value::as_str)
        .map(str::to_string);

    let message = data
        .get("errorMessage")
        .and_then(Value::as_str)
        .or_else(|| body.get("msg").and_then(Value::as_str))
        .map(str::to_string);

    StemTaskStatus {
        task_id,
        code: body.get("code").and_then(Value::as_i64),
        status,
        message,
        assets: data.get("response").cloned().unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_success_response() {
        let body = json!({
            "code": 200,
            "msg": "success",
            "data": {
                "taskId": "st-1",
                "successFlag": "SUCCESS",
                "response": {
                    "vocalUrl": "https://cdn.provider/vocal.mp3",
                    "instrumentalUrl": "https://cdn.provider/inst.mp3"
                }
            }
        });

        let status = parse_stem_task_response("st-1", &body);
        assert_eq!(status.task_id, "st-1");
        assert_eq!(status.code, Some(200));
        assert!(!status.is_failure());
        assert!(status.assets.get("vocalUrl").is_some());
    }

    #[test]
    fn test_parse_failure_by_status() {
        let body = json!({
            "code": 200,
            "data": {
                "taskId": "st-2",
                "successFlag": "SENSITIVE_WORD_ERROR",
                "errorMessage": "lyrics rejected"
            }
        });

        let status = parse_stem_task_response("st-2", &body);
        assert!(status.is_failure());
        assert_eq!(status.message.as_deref(), Some("lyrics rejected"));
    }

    #[test]
    fn test_parse_failure_by_code() {
        let body = json!({"code": 500, "msg": "boom"});
        let status = parse_stem_task_response("st-3", &body);
        assert!(status.is_failure());
        assert_eq!(status.message.as_deref(), Some("boom"));
        assert_eq!(status.task_id, "st-3", "requested id fills a missing data.taskId");
    }

    #[test]
    fn test_missing_api_key() {
        let client = ProviderClient::new("https://api.musegen.example".to_string(), None).unwrap();
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(client.query_stem_task("st-1"))
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey));
    }
}
