use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::job::TattooOptions;

const BASE_PROMPT: &str = concat!(
    "Apply the tattoo design from <img>1</img> onto the body in <img>0</img>, ",
    "placing it EXACTLY in the RED MARKED AREA. ",
    "Create a photorealistic result with: ",
    "- The tattoo seamlessly blended into the skin texture ",
    "- Natural lighting and shadows matching the original photo ",
    "- Realistic skin texture overlaying the tattoo ",
    "- Professional, high-quality tattoo appearance ",
    "- The rest of the body unchanged from the original ",
    "- Complete removal of the red marking. ",
    "Generate a hyperrealistic image showing how this tattoo would naturally look on that body part."
);

/// Image-generation service that composites a tattoo onto a body photo.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn apply_tattoo(
        &self,
        body_image: &[u8],
        tattoo_image: &[u8],
        options: &TattooOptions,
    ) -> Result<Vec<u8>, AiError>;
}

/// Client for the Reve image remix API.
pub struct ReveClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct RemixRequest<'a> {
    prompt: String,
    reference_images: [String; 2],
    aspect_ratio: &'a str,
    version: &'a str,
}

#[derive(Deserialize)]
struct RemixResponse {
    image: Option<String>,
    #[serde(default)]
    content_violation: bool,
    request_id: Option<String>,
    credits_used: Option<f64>,
    credits_remaining: Option<f64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error_code: Option<String>,
}

impl ReveClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, AiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AiError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

/// Prompt sent to the provider, with the user's optional hints appended.
pub fn build_prompt(options: &TattooOptions) -> String {
    let mut prompt = BASE_PROMPT.to_string();
    let description = options.description.trim();
    if !description.is_empty() {
        prompt.push_str(&format!(" Additional user instructions: {description}."));
    }
    if !options.styles.is_empty() {
        prompt.push_str(&format!(
            " Apply the following styles to the tattoo: {}.",
            options.styles.join(", ")
        ));
    }
    if !options.colors.is_empty() {
        prompt.push_str(&format!(
            " Use the following colors for the tattoo: {}.",
            options.colors.join(", ")
        ));
    }
    prompt
}

#[async_trait]
impl AiProvider for ReveClient {
    async fn apply_tattoo(
        &self,
        body_image: &[u8],
        tattoo_image: &[u8],
        options: &TattooOptions,
    ) -> Result<Vec<u8>, AiError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let request = RemixRequest {
            prompt: build_prompt(options),
            reference_images: [engine.encode(body_image), engine.encode(tattoo_image)],
            aspect_ratio: "1:1",
            version: "latest",
        };

        let response = self
            .http
            .post(format!("{}/remix", self.base_url))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(AiError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody {
                    message: Some(message),
                    error_code,
                }) => match error_code {
                    Some(code) => format!("{message} (code {code})"),
                    None => message,
                },
                _ => body,
            };
            return Err(AiError::Status { status, message });
        }

        let remix: RemixResponse = response.json().await.map_err(AiError::Http)?;
        if remix.content_violation {
            return Err(AiError::ContentViolation);
        }

        tracing::debug!(
            request_id = remix.request_id.as_deref().unwrap_or("n/a"),
            credits_used = remix.credits_used,
            credits_remaining = remix.credits_remaining,
            "Remix response received"
        );

        let encoded = remix.image.ok_or(AiError::MissingImage)?;
        engine.decode(encoded).map_err(AiError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned HTTP {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("Generated image violates the provider's content policy")]
    ContentViolation,

    #[error("Provider response did not contain an image")]
    MissingImage,

    #[error("Generated image is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl AiError {
    /// Rate limits, server errors, timeouts and transport failures may succeed
    /// on a later attempt; everything else is a rejection of the input.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::Http(e) => !e.is_builder(),
            AiError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
            }
            AiError::ContentViolation | AiError::MissingImage | AiError::Decode(_) => false,
        }
    }
}
