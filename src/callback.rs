//! Completion reporting: POST the build outcome to the configured
//! callback receiver with exponential backoff.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::models::BuildJob;

const MAX_RETRIES: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The JSON body POSTed to the callback receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CallbackClient {
    http: reqwest::Client,
    callback_url: String,
}

impl CallbackClient {
    pub fn new(callback_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            callback_url: callback_url.trim().to_string(),
        }
    }

    /// An empty URL disables the reporter.
    pub fn is_enabled(&self) -> bool {
        !self.callback_url.is_empty()
    }

    /// POST the outcome of one job. Retries transport errors and non-2xx
    /// responses with exponential backoff and ±20% jitter; after
    /// exhausting the retry budget the last error is returned.
    pub async fn report_result(
        &self,
        job: &BuildJob,
        status: &str,
        error_msg: &str,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let payload = build_payload(job, status, error_msg);
        debug!(job_id = %job.id, status = %status, "reporting build result");

        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                warn!(
                    job_id = %job.id,
                    attempt,
                    max = MAX_RETRIES,
                    delay_ms = delay.as_millis() as u64,
                    "retrying callback"
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .http
                .post(&self.callback_url)
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(anyhow!(
                        "backend returned non-2xx status: {}",
                        resp.status().as_u16()
                    ));
                    warn!(job_id = %job.id, status = resp.status().as_u16(), "callback rejected");
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "callback request failed");
                    last_err = Some(err.into());
                }
            }
        }

        Err(anyhow!(
            "failed to report result after {} attempts: {}",
            MAX_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

fn build_payload(job: &BuildJob, status: &str, error_msg: &str) -> ReportPayload {
    let started_at = job.started_at.unwrap_or_else(Utc::now);
    let finished_at = Utc::now();
    let duration_seconds = (finished_at - started_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    ReportPayload {
        id: job.id.clone(),
        project_id: job.project_id.clone(),
        user_id: job.user_id.clone(),
        status: status.to_string(),
        image_tag: if job.image_tag.is_empty() {
            None
        } else {
            Some(job.image_tag.clone())
        },
        started_at,
        finished_at,
        duration_seconds,
        log_path: job.log_path.clone(),
        error: if error_msg.is_empty() {
            None
        } else {
            Some(error_msg.to_string())
        },
    }
}

/// Exponential backoff: 2s, 4s, 8s, 16s, 32s, each with ±20% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let backoff = BASE_DELAY.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jitter = {
        let mut rng = rand::thread_rng();
        rng.gen::<f64>() * 0.4 - 0.2
    };
    Duration::from_secs_f64(backoff * (1.0 + jitter))
}
