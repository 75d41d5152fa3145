use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a tattoo preview job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Failure taxonomy shared by submission, processing and the HTTP surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    StorageUnavailable,
    JobStoreUnavailable,
    EnqueueFailed,
    UnknownJob,
    MissingInput,
    AiRejected,
    AiUnavailable,
    AttemptsExhausted,
}

/// Structured reason recorded on a terminally failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Location of an object in the object store, rendered as `bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid object reference {0:?} (expected \"bucket/key\")")]
pub struct InvalidObjectRef(pub String);

impl FromStr for ObjectRef {
    type Err = InvalidObjectRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(ObjectRef::new(bucket, key))
            }
            _ => Err(InvalidObjectRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for ObjectRef {
    type Error = InvalidObjectRef;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectRef> for String {
    fn from(value: ObjectRef) -> Self {
        value.to_string()
    }
}

/// The two uploaded inputs of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRefs {
    pub body: ObjectRef,
    pub tattoo: ObjectRef,
}

/// Optional user hints forwarded into the AI prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct TattooOptions {
    #[garde(length(max = 10), inner(length(min = 1, max = 50)))]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<String>,

    #[garde(length(max = 10), inner(length(min = 1, max = 50)))]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,

    #[garde(length(max = 500))]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl TattooOptions {
    pub fn is_empty(&self) -> bool {
        self.styles.is_empty() && self.colors.is_empty() && self.description.trim().is_empty()
    }
}

/// A tattoo preview job and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub input_refs: InputRefs,
    pub options: TattooOptions,
    pub attempt_count: i32,
    pub output_ref: Option<ObjectRef>,
    pub error: Option<JobError>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A compare-and-swap state change applied to a job record.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `pending -> processing`, or takeover of an expired `processing` lease.
    Claim {
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        max_attempts: i32,
    },
    /// `processing -> succeeded`.
    Succeed {
        output_ref: ObjectRef,
        now: DateTime<Utc>,
    },
    /// `processing -> pending`, a retry has been scheduled.
    Release { now: DateTime<Utc> },
    /// `pending | processing -> failed`.
    Fail { error: JobError, now: DateTime<Utc> },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Claim { .. } => JobStatus::Processing,
            Transition::Succeed { .. } => JobStatus::Succeeded,
            Transition::Release { .. } => JobStatus::Pending,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    /// Whether `from` is a legal prior status for this transition.
    pub fn allows_from(&self, from: JobStatus) -> bool {
        match self {
            Transition::Claim { .. } => {
                matches!(from, JobStatus::Pending | JobStatus::Processing)
            }
            Transition::Succeed { .. } | Transition::Release { .. } => {
                from == JobStatus::Processing
            }
            Transition::Fail { .. } => {
                matches!(from, JobStatus::Pending | JobStatus::Processing)
            }
        }
    }
}

impl Job {
    pub fn new(id: Uuid, input_refs: InputRefs, options: TattooOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            input_refs,
            options,
            attempt_count: 0,
            output_ref: None,
            error: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True while another worker holds an unexpired claim on this job.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|until| until > now)
    }

    /// Apply `transition` if the job is currently in `expected` and the
    /// transition's preconditions hold. Returns `false` (and leaves the job
    /// untouched) for stale transitions.
    pub fn apply(&mut self, expected: JobStatus, transition: &Transition) -> bool {
        if self.status != expected || !transition.allows_from(expected) {
            return false;
        }

        match transition {
            Transition::Claim {
                now,
                lease_until,
                max_attempts,
            } => {
                if self.attempt_count >= *max_attempts || self.lease_is_live(*now) {
                    return false;
                }
                self.status = JobStatus::Processing;
                self.attempt_count += 1;
                self.lease_expires_at = Some(*lease_until);
                self.updated_at = *now;
            }
            Transition::Succeed { output_ref, now } => {
                self.status = JobStatus::Succeeded;
                self.output_ref = Some(output_ref.clone());
                self.lease_expires_at = None;
                self.updated_at = *now;
            }
            Transition::Release { now } => {
                self.status = JobStatus::Pending;
                self.lease_expires_at = None;
                self.updated_at = *now;
            }
            Transition::Fail { error, now } => {
                self.status = JobStatus::Failed;
                self.error = Some(error.clone());
                self.lease_expires_at = None;
                self.updated_at = *now;
            }
        }
        true
    }
}
