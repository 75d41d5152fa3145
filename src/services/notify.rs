use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::models::job::{Job, ObjectRef};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(rename = "socketId", skip_serializing_if = "Option::is_none")]
    socket_id: Option<&'a str>,
    data: WebhookData<'a>,
}

#[derive(Debug, Serialize)]
struct WebhookData<'a> {
    status: &'static str,
    result_url: Option<String>,
    result_ref: String,
    processing_time: f64,
    original_body_filename: &'a str,
    original_tattoo_filename: &'a str,
}

/// Posts a completion callback for every succeeded job.
///
/// Delivery is best-effort: failures are logged and never affect the job.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn job_succeeded(
        &self,
        job: &Job,
        socket_id: Option<&str>,
        output_ref: &ObjectRef,
        result_url: Option<String>,
        elapsed: Duration,
    ) {
        let payload = WebhookPayload {
            job_id: job.id.to_string(),
            socket_id,
            data: WebhookData {
                status: "completed",
                result_url,
                result_ref: output_ref.to_string(),
                processing_time: elapsed.as_secs_f64(),
                original_body_filename: &job.input_refs.body.key,
                original_tattoo_filename: &job.input_refs.tattoo.key,
            },
        };

        match self.http.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(job_id = %job.id, "Webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    job_id = %job.id,
                    status = response.status().as_u16(),
                    "Webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Webhook delivery failed");
            }
        }
    }
}
