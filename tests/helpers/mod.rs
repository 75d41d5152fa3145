//! In-memory stand-ins for the pipeline's external services, plus HTTP
//! helpers for E2E runs against a deployed stack.

#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::{multipart, StatusCode};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use tattoo_preview::{
    models::job::{ObjectRef, TattooOptions},
    models::message::JobMessage,
    services::{
        ai::{AiError, AiProvider},
        job_store::MemoryJobStore,
        queue::{Delivery, MessageBroker, QueueError, QueueStats},
        retry::RetryPolicy,
        storage::{ObjectStore, StorageError},
        submitter::JobSubmitter,
        validation::ImageLimits,
        worker::{JobWorker, Outcome, WorkerSettings},
    },
};

use crate::fixtures;

pub const INPUT_BUCKET: &str = "input-images";
pub const OUTPUT_BUCKET: &str = "output-images";

// ── Object store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectRef, (Vec<u8>, String)>>,
    fail_put_prefix: Mutex<Option<String>>,
    fail_gets: AtomicBool,
    gets: AtomicUsize,
}

impl MemoryObjectStore {
    /// Make every `put` whose key starts with `prefix` fail ("" fails all).
    pub fn fail_puts_matching(&self, prefix: &str) {
        *self.fail_put_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, object: &ObjectRef, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.clone(), (data, "image/png".to_string()));
    }

    pub fn remove(&self, object: &ObjectRef) {
        self.objects.lock().unwrap().remove(object);
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.objects.lock().unwrap().contains_key(object)
    }

    pub fn data(&self, object: &ObjectRef) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .map(|(data, _)| data.clone())
    }

    pub fn content_type(&self, object: &ObjectRef) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .map(|(_, content_type)| content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

fn unavailable() -> StorageError {
    StorageError::Timeout(Duration::from_millis(5))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        if let Some(prefix) = self.fail_put_prefix.lock().unwrap().as_deref() {
            if object.key.starts_with(prefix) {
                return Err(unavailable());
            }
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object.clone(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(object.key.clone()))
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        Ok(self.contains(object))
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), StorageError> {
        self.remove(object);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|o| o.bucket == bucket && o.key.starts_with(prefix))
            .map(|o| o.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn presigned_url(
        &self,
        object: &ObjectRef,
        expires: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!("memory://{object}?expires={}", expires.as_secs()))
    }
}

// ── Broker ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<String>,
    in_flight: Vec<String>,
    acked: usize,
    nack_delays: Vec<Duration>,
    dead: Vec<(String, String)>,
}

/// At-least-once queue that ignores nack delays: a nacked message is ready
/// again immediately, with the requested delay recorded.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    fail_publish: AtomicBool,
    failing_settles: AtomicUsize,
}

impl MemoryBroker {
    /// Make the next `count` ack/nack/dead-letter calls fail, leaving the
    /// message in flight.
    pub fn fail_next_settles(&self, count: usize) {
        self.failing_settles.store(count, Ordering::SeqCst);
    }

    fn settle_fails(&self) -> bool {
        self.failing_settles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn push_raw(&self, payload: &str) {
        self.state
            .lock()
            .unwrap()
            .ready
            .push_back(payload.to_string());
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked
    }

    pub fn nack_delays(&self) -> Vec<Duration> {
        self.state.lock().unwrap().nack_delays.clone()
    }

    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dead.clone()
    }

    fn settle(state: &mut BrokerState, delivery: &Delivery) -> bool {
        match state.in_flight.iter().position(|p| p == delivery.payload()) {
            Some(index) => {
                state.in_flight.remove(index);
                true
            }
            None => false,
        }
    }
}

fn broker_down() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "broker unreachable",
    )))
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    fn queue_name(&self) -> &str {
        "test_queue"
    }

    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(broker_down());
        }
        let payload = serde_json::to_string(message)?;
        self.state.lock().unwrap().ready.push_back(payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.ready.pop_front().map(|payload| {
            state.in_flight.push(payload.clone());
            Delivery::new(payload)
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.settle_fails() {
            return Err(broker_down());
        }
        let mut state = self.state.lock().unwrap();
        if Self::settle(&mut state, delivery) {
            state.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        if self.settle_fails() {
            return Err(broker_down());
        }
        let mut state = self.state.lock().unwrap();
        if Self::settle(&mut state, delivery) {
            state.nack_delays.push(delay);
            state.ready.push_back(delivery.payload().to_string());
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        if self.settle_fails() {
            return Err(broker_down());
        }
        let mut state = self.state.lock().unwrap();
        if Self::settle(&mut state, delivery) {
            state
                .dead
                .push((delivery.payload().to_string(), reason.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().unwrap();
        let oldest_published_at = state
            .ready
            .front()
            .and_then(|payload| Delivery::new(payload.clone()).decode().ok())
            .map(|message| message.published_at);
        Ok(QueueStats {
            ready: state.ready.len() as u64,
            delayed: 0,
            in_flight: state.in_flight.len() as u64,
            consumers: 1,
            oldest_published_at,
        })
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let removed = state.ready.len() as u64;
        state.ready.clear();
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ── AI provider ──────────────────────────────────────────────────────────

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum AiStep {
    Composite,
    Status(u16),
    ContentViolation,
    Garbage,
    /// A valid composite encoded as JPEG.
    Jpeg,
}

/// Provider that replays a script, then keeps returning a valid composite.
#[derive(Default)]
pub struct ScriptedAi {
    script: Mutex<VecDeque<AiStep>>,
    calls: AtomicUsize,
    last_options: Mutex<Option<TattooOptions>>,
    gated: AtomicBool,
    /// Signalled when a gated call has started.
    pub entered: Notify,
    /// Lets a gated call finish.
    pub release: Notify,
}

impl ScriptedAi {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn scripted(steps: impl IntoIterator<Item = AiStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    /// The first call blocks until `release` is notified.
    pub fn gated() -> Self {
        let ai = Self::default();
        ai.gated.store(true, Ordering::SeqCst);
        ai
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<TattooOptions> {
        self.last_options.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiProvider for ScriptedAi {
    async fn apply_tattoo(
        &self,
        _body_image: &[u8],
        _tattoo_image: &[u8],
        options: &TattooOptions,
    ) -> Result<Vec<u8>, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());

        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AiStep::Composite);
        match step {
            AiStep::Composite => Ok(fixtures::composite_result()),
            AiStep::Status(code) => Err(AiError::Status {
                status: StatusCode::from_u16(code).unwrap(),
                message: format!("scripted {code}"),
            }),
            AiStep::ContentViolation => Err(AiError::ContentViolation),
            AiStep::Garbage => Ok(b"definitely not an image".to_vec()),
            AiStep::Jpeg => Ok(fixtures::body_photo()),
        }
    }
}

// ── Pipeline harness ─────────────────────────────────────────────────────

/// Submitter and worker wired to shared in-memory services.
pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub storage: Arc<MemoryObjectStore>,
    pub broker: Arc<MemoryBroker>,
    pub ai: Arc<ScriptedAi>,
    pub submitter: JobSubmitter,
    pub worker: Arc<JobWorker>,
}

pub fn test_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_secs(1),
    )
    .with_jitter(0.0)
}

impl Harness {
    pub fn new(ai: ScriptedAi, max_attempts: u32) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let storage = Arc::new(MemoryObjectStore::default());
        let broker = Arc::new(MemoryBroker::default());
        let ai = Arc::new(ai);

        let submitter = JobSubmitter::new(
            jobs.clone(),
            storage.clone(),
            broker.clone(),
            INPUT_BUCKET,
            ImageLimits::default(),
        );
        let worker = JobWorker::new(
            jobs.clone(),
            storage.clone(),
            ai.clone(),
            broker.clone(),
            test_retry_policy(max_attempts),
            WorkerSettings {
                output_bucket: OUTPUT_BUCKET.to_string(),
                concurrency: 2,
                lease: Duration::from_secs(60),
                poll_interval: Duration::from_millis(10),
                result_url_ttl: Duration::from_secs(600),
            },
        );

        Self {
            jobs,
            storage,
            broker,
            ai,
            submitter,
            worker: Arc::new(worker),
        }
    }

    /// Submit the standard fixture pair and return the job id.
    pub async fn submit_valid(&self) -> Uuid {
        self.submitter
            .submit(
                &fixtures::body_photo(),
                &fixtures::tattoo_design(),
                TattooOptions::default(),
            )
            .await
            .expect("valid submission")
            .job_id
    }

    /// Receive and handle one delivery.
    pub async fn step(&self) -> Option<Outcome> {
        let delivery = self.broker.receive().await.expect("receive")?;
        Some(self.worker.handle(delivery).await.expect("settle delivery"))
    }

    /// Handle deliveries until the queue is empty.
    pub async fn drain(&self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for _ in 0..50 {
            match self.step().await {
                Some(outcome) => outcomes.push(outcome),
                None => return outcomes,
            }
        }
        panic!("queue did not drain, outcomes so far: {outcomes:?}");
    }
}

// ── HTTP helpers for E2E runs ────────────────────────────────────────────

/// POST /upload with the given images and options.
pub async fn upload_images(
    client: &reqwest::Client,
    base_url: &str,
    body_image: Vec<u8>,
    tattoo_image: Vec<u8>,
    options: &TattooOptions,
) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new()
        .part(
            "body_image",
            multipart::Part::bytes(body_image)
                .file_name("body.jpg")
                .mime_str("image/jpeg")?,
        )
        .part(
            "tattoo_image",
            multipart::Part::bytes(tattoo_image)
                .file_name("tattoo.png")
                .mime_str("image/png")?,
        );
    for style in &options.styles {
        form = form.text("styles", style.clone());
    }
    for color in &options.colors {
        form = form.text("colors", color.clone());
    }
    if !options.description.is_empty() {
        form = form.text("description", options.description.clone());
    }

    let response = client
        .post(format!("{base_url}/upload"))
        .multipart(form)
        .send()
        .await?;
    let status = response.status();
    let body = response.json::<Value>().await?;
    Ok((status, body))
}

/// Poll GET /jobs/{job_id} until the job is terminal (with timeout).
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    timeout_secs: u64,
) -> Result<Value, Box<dyn std::error::Error>> {
    let max_polls = timeout_secs * 2; // Poll every 500ms

    for poll in 0..max_polls {
        let response = client
            .get(format!("{base_url}/jobs/{job_id}"))
            .send()
            .await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {error_text}").into());
        }

        let body = response.json::<Value>().await?;
        match body["status"].as_str() {
            Some("succeeded") | Some("failed") => return Ok(body),
            Some("pending") | Some("processing") => {
                if poll % 10 == 0 && poll > 0 {
                    println!("  ... still waiting (poll {poll}/{max_polls})");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {other:?}").into()),
        }
    }

    Err(format!("Job did not finish within {timeout_secs} seconds").into())
}
