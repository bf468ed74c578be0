//! Best-effort delivery of a job's final result to its `callback_url`.
//!
//! A callback failure never changes the job's own verdict — `JobResult` has
//! already been persisted to the artifact store by the time this runs. Only
//! `http`/`https` URLs are dialed; anything else is refused before a request
//! is attempted.

use std::time::Duration;

use flow_core::{Job, JobResult};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deliver `result` to `job.callback_url` if one was set; a no-op otherwise.
pub async fn maybe_deliver(job: &Job, result: &JobResult) {
    if let Some(url) = &job.callback_url {
        deliver(url, result).await;
    }
}

/// POST `result` as JSON to `callback_url`. Logs and swallows every failure:
/// a bad callback endpoint is the caller's problem, not reason to fail a job
/// that otherwise completed.
pub async fn deliver(callback_url: &str, result: &JobResult) {
    let Ok(url) = reqwest::Url::parse(callback_url) else {
        tracing::warn!(callback_url, "callback_url is not a valid url, skipping");
        return;
    };
    if !matches!(url.scheme(), "http" | "https") {
        tracing::warn!(callback_url, scheme = url.scheme(), "callback_url scheme must be http or https, skipping");
        return;
    }

    let client = match reqwest::Client::builder().timeout(CALLBACK_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build callback http client");
            return;
        }
    };

    match client.post(url).json(result).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(job_id = %result.job_id, callback_url, "callback delivered");
        }
        Ok(response) => {
            tracing::warn!(job_id = %result.job_id, callback_url, status = %response.status(), "callback endpoint returned non-success");
        }
        Err(e) => {
            tracing::warn!(job_id = %result.job_id, callback_url, error = %e, "callback delivery failed");
        }
    }
}
