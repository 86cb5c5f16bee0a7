use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::{debug, warn};

use hasivu_core::{
    CoreError,
    queue::{JobHandler, JobLease, JobOutcome},
    resilience::CircuitBreaker,
};

/// Delivers each leased job to an HTTP endpoint as a JSON POST.
///
/// 2xx completes the job. 408, 429, 5xx and transport errors are retried with
/// backoff; any other status dead-letters the job. Deliveries go through the
/// queue's circuit breaker so a failing endpoint is not hammered.
pub struct WebhookJobHandler {
    client: reqwest::Client,
    url: String,
    breaker: Arc<CircuitBreaker>,
}

impl fmt::Debug for WebhookJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookJobHandler")
            .field("url", &self.url)
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

impl WebhookJobHandler {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            breaker,
        })
    }

    async fn deliver(&self, lease: &JobLease) -> hasivu_core::Result<StatusCode> {
        let job = &lease.job;
        let response = self
            .client
            .post(&self.url)
            .header("x-hasivu-job-id", job.id.to_string())
            .header("x-hasivu-school-id", job.school_id.to_string())
            .header("x-hasivu-attempt", job.attempts.to_string())
            .header("x-hasivu-correlation-id", job.correlation_id.to_string())
            .json(&job.payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CoreError::Timeout(err.to_string())
                } else {
                    CoreError::Unavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CoreError::Unavailable(format!("webhook returned {status}")));
        }
        Ok(status)
    }
}

fn outcome_for_status(status: StatusCode) -> JobOutcome {
    if status.is_success() {
        JobOutcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        JobOutcome::Retry(format!("webhook returned {status}"))
    } else {
        JobOutcome::Fatal(format!("webhook rejected job with {status}"))
    }
}

#[async_trait]
impl JobHandler for WebhookJobHandler {
    async fn handle(&self, lease: &JobLease) -> JobOutcome {
        match self.breaker.call(self.deliver(lease)).await {
            Ok(status) => {
                debug!(
                    target: "hasivu::queue",
                    job_id = %lease.job.id,
                    %status,
                    "webhook delivery finished"
                );
                outcome_for_status(status)
            }
            Err(err) => {
                warn!(
                    target: "hasivu::queue",
                    job_id = %lease.job.id,
                    url = %self.url,
                    error = %err,
                    "webhook delivery failed"
                );
                JobOutcome::Retry(err.to_string())
            }
        }
    }
}
