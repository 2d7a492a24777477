//! REST client for the control plane.
//!
//! Every call the agent makes (enablement checks, job claims, completion
//! reports, heartbeats) goes through one `reqwest::Client` carrying the
//! fixed transport timeout. Any transport problem maps into
//! [`NetworkError`]; nothing here retries.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::NetworkError;
use crate::heartbeat::StatusSnapshot;
use crate::job::{CompletionReport, JobDescriptor, JobResult};

/// Enable/disable flag shape shared by the queue and worker endpoints.
#[derive(Debug, Deserialize)]
struct FlagResponse {
    attributes: FlagAttributes,
}

#[derive(Debug, Deserialize)]
struct FlagAttributes {
    #[serde(default)]
    disabled: bool,
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    worker_id: Uuid,
}

impl ApiClient {
    pub fn new(base_url: &str, worker_id: Uuid, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id,
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// GET `/queue`: whether the whole queue is disabled.
    pub async fn queue_disabled(&self) -> Result<bool, NetworkError> {
        self.get_flag("/queue").await
    }

    /// GET `/workers/{id}`: whether this worker is disabled on the server.
    pub async fn worker_disabled(&self) -> Result<bool, NetworkError> {
        self.get_flag(&format!("/workers/{}", self.worker_id)).await
    }

    async fn get_flag(&self, path: &str) -> Result<bool, NetworkError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&url, e))?;

        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }

        let flag: FlagResponse = resp.json().await.map_err(|e| NetworkError::Decode {
            reason: e.to_string(),
            url,
        })?;
        Ok(flag.attributes.disabled)
    }

    /// GET `/queue/poll`: claim the next job. `None` when the queue is
    /// empty (404).
    pub async fn poll_job(&self) -> Result<Option<JobDescriptor>, NetworkError> {
        let url = self.url("/queue/poll");
        tracing::debug!(url = %url, "GET");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&url, e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }

        let job = resp.json().await.map_err(|e| NetworkError::Decode {
            reason: e.to_string(),
            url,
        })?;
        Ok(Some(job))
    }

    /// PATCH `/jobs/{id}/completed`: report the job outcome.
    ///
    /// The caller treats this as best-effort; a failure here is not retried.
    pub async fn report_completion(
        &self,
        job_id: &str,
        result: &JobResult,
    ) -> Result<(), NetworkError> {
        let url = self.url(&format!("/jobs/{job_id}/completed"));
        let body = CompletionReport {
            failed: !result.completed,
            info: result,
        };
        tracing::debug!(url = %url, "PATCH");
        let resp = self
            .client
            .patch(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&url, e))?;

        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }

    /// POST `/workers/{id}`: heartbeat delivery.
    pub async fn post_status(&self, snapshot: &StatusSnapshot) -> Result<(), NetworkError> {
        let url = self.url(&format!("/workers/{}", self.worker_id));
        let resp = self
            .client
            .post(&url)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&url, e))?;

        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Uuid::new_v4(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let api = client("http://queue.local:5000/");
        assert_eq!(api.url("/queue"), "http://queue.local:5000/queue");
        assert_eq!(api.url("/queue/poll"), "http://queue.local:5000/queue/poll");
    }

    #[test]
    fn flag_response_parses_server_shape() {
        let flag: FlagResponse =
            serde_json::from_value(serde_json::json!({"attributes": {"disabled": true}})).unwrap();
        assert!(flag.attributes.disabled);

        let flag: FlagResponse =
            serde_json::from_value(serde_json::json!({"attributes": {}})).unwrap();
        assert!(!flag.attributes.disabled);
    }

    #[tokio::test]
    async fn unreachable_server_classifies_as_connect() {
        // Nothing listens on port 1.
        let api = client("http://127.0.0.1:1");
        let err = api.queue_disabled().await.unwrap_err();
        assert_eq!(err.kind(), NetworkErrorKind::Connect);
    }

    #[tokio::test]
    async fn poll_job_surfaces_transport_errors() {
        let api = client("http://127.0.0.1:1");
        assert!(api.poll_job().await.is_err());
    }
}
