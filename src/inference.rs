use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::UpscaleError;

/// TCP connect budget for backend calls; the overall per-request timeout is
/// caller-supplied and must stay below the watcher's staleness thresholds.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal and in-flight states of one inference call, mirroring the
/// Replicate prediction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

/// The GPU inference service, treated as a black box: one image plus a scale
/// multiplier per call, subject to the fixed pixel ceiling.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn create(&self, input_url: &str, scale: u32) -> Result<Prediction, UpscaleError>;
    async fn get(&self, prediction_id: &str) -> Result<Prediction, UpscaleError>;
}

// ---------------------------------------------------------------------------
// Replicate HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReplicatePrediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl ReplicatePrediction {
    fn into_prediction(self) -> Prediction {
        // real-esrgan style models return either a bare URL string or a
        // single-element array.
        let output_url = self.output.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Array(items) => items
                .into_iter()
                .find_map(|i| i.as_str().map(str::to_string)),
            _ => None,
        });
        Prediction {
            id: self.id,
            status: self.status,
            output_url,
            error: self.error,
        }
    }
}

pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    model_version: String,
}

impl ReplicateClient {
    /// `timeout` caps every request end to end, so a hung backend connection
    /// surfaces as a transient error instead of stalling the job forever.
    pub fn new(
        base_url: &str,
        token: &str,
        model_version: &str,
        timeout: Duration,
    ) -> Result<Self, UpscaleError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| UpscaleError::Backend(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            model_version: model_version.to_string(),
        })
    }

    async fn parse_response(
        resp: Result<reqwest::Response, reqwest::Error>,
        what: &str,
    ) -> Result<Prediction, UpscaleError> {
        let resp = resp.map_err(|e| UpscaleError::Transient(format!("{}: {}", what, e)))?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(UpscaleError::Transient(format!("{}: HTTP {}", what, status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpscaleError::Backend(format!(
                "{}: HTTP {}: {}",
                what, status, body
            )));
        }
        let parsed: ReplicatePrediction = resp
            .json()
            .await
            .map_err(|e| UpscaleError::Backend(format!("{}: bad response body: {}", what, e)))?;
        Ok(parsed.into_prediction())
    }
}

#[async_trait]
impl InferenceBackend for ReplicateClient {
    async fn create(&self, input_url: &str, scale: u32) -> Result<Prediction, UpscaleError> {
        debug!("create prediction scale={} input={}", scale, input_url);
        let body = json!({
            "version": self.model_version,
            "input": {
                "image": input_url,
                "scale": scale,
            }
        });
        let resp = self
            .http
            .post(format!("{}/v1/predictions", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await;
        Self::parse_response(resp, "create prediction").await
    }

    async fn get(&self, prediction_id: &str) -> Result<Prediction, UpscaleError> {
        let resp = self
            .http
            .get(format!(
                "{}/v1/predictions/{}",
                self.base_url, prediction_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await;
        Self::parse_response(resp, "get prediction").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_output_from_string() {
        let raw: ReplicatePrediction = serde_json::from_value(json!({
            "id": "p1",
            "status": "succeeded",
            "output": "https://cdn.example/out.png"
        }))
        .unwrap();
        let p = raw.into_prediction();
        assert_eq!(p.status, PredictionStatus::Succeeded);
        assert_eq!(p.output_url.as_deref(), Some("https://cdn.example/out.png"));
    }

    #[test]
    fn test_prediction_output_from_array() {
        let raw: ReplicatePrediction = serde_json::from_value(json!({
            "id": "p2",
            "status": "succeeded",
            "output": ["https://cdn.example/a.png", "https://cdn.example/b.png"]
        }))
        .unwrap();
        assert_eq!(
            raw.into_prediction().output_url.as_deref(),
            Some("https://cdn.example/a.png")
        );
    }

    #[tokio::test]
    async fn test_create_times_out_against_silent_server() {
        // Accepts connections and never answers; without the client timeout
        // this call would hang forever.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ReplicateClient::new(
            &format!("http://{}", addr),
            "tok",
            "v1",
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client
            .create("http://localhost/in.png", 4)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "timeout must be transient, got: {}", err);
    }

    #[test]
    fn test_prediction_failed_carries_error() {
        let raw: ReplicatePrediction = serde_json::from_value(json!({
            "id": "p3",
            "status": "failed",
            "error": "CUDA out of memory"
        }))
        .unwrap();
        let p = raw.into_prediction();
        assert_eq!(p.status, PredictionStatus::Failed);
        assert!(p.status.is_terminal());
        assert_eq!(p.error.as_deref(), Some("CUDA out of memory"));
    }
}
