use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{InputRefs, Job, TattooOptions};

/// Job payload carried by the message broker.
///
/// Wire shape: `{"job_id": "...", "input_refs": {"body": "bucket/key", "tattoo": "bucket/key"}}`
/// plus the optional `options`, the client's `socketId` and the publish
/// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub input_refs: InputRefs,
    #[serde(default, skip_serializing_if = "TattooOptions::is_empty")]
    pub options: TattooOptions,
    /// Client connection to address the completion webhook to.
    #[serde(default, rename = "socketId", skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            input_refs: job.input_refs.clone(),
            options: job.options.clone(),
            socket_id: None,
            published_at: Utc::now(),
        }
    }

    pub fn with_socket_id(mut self, socket_id: Option<String>) -> Self {
        self.socket_id = socket_id;
        self
    }
}
