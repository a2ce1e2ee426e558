//! HTTP transform dispatcher.
//!
//! For deployments where transforms run behind a service instead of as
//! local executables: POST {base_url}/transforms/{name} with the JSON
//! payload as body, JSON result back.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{DispatchError, TransformDispatcher};

/// Dispatches transforms to a remote transform service
pub struct HttpDispatcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn transform_url(&self, transform: &str) -> String {
        format!("{}/transforms/{}", self.base_url.trim_end_matches('/'), transform)
    }
}

#[async_trait]
impl TransformDispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(
        &self,
        transform: &str,
        input: &Value,
        deadline: Duration,
    ) -> Result<Value, DispatchError> {
        let response = self
            .client
            .post(self.transform_url(transform))
            .timeout(deadline)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        transform: transform.to_string(),
                        elapsed: deadline,
                    }
                } else {
                    DispatchError::ExecutionFailure {
                        transform: transform.to_string(),
                        exit_code: None,
                        stderr: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(DispatchError::ProcessorNotFound {
                transform: transform.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::ExecutionFailure {
                transform: transform.to_string(),
                exit_code: Some(status.as_u16() as i32),
                stderr: body,
            });
        }

        let body = response.text().await.map_err(|e| DispatchError::ExecutionFailure {
            transform: transform.to_string(),
            exit_code: None,
            stderr: format!("failed to read response body: {e}"),
        })?;

        serde_json::from_str(&body).map_err(|e| DispatchError::OutputParseError {
            transform: transform.to_string(),
            detail: e.to_string(),
        })
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await.map_err(|e| {
            DispatchError::ExecutionFailure {
                transform: "health".to_string(),
                exit_code: None,
                stderr: e.to_string(),
            }
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DispatchError::ExecutionFailure {
                transform: "health".to_string(),
                exit_code: Some(response.status().as_u16() as i32),
                stderr: "transform service unhealthy".to_string(),
            })
        }
    }
}
