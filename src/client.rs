//! The extraction client: one card image in, one set of structured fields
//! out.
//!
//! The external API is an OpenAI-style `/chat/completions` endpoint (we
//! default to OpenRouter). Each attempt is classified as OK, transient or
//! fatal via [`keen_retry::RetryResult`], and [`extract_with_retries`] drives
//! the retry loop: transient failures back off linearly (doubled for rate
//! limits), fatal failures such as a rejected credential surface immediately
//! without burning retries.

use std::{error, fmt, time::Duration};

use async_trait::async_trait;
use keen_retry::RetryResult;
use leaky_bucket::RateLimiter;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    data_url::image_data_url,
    prelude::*,
    prompt::EXTRACTION_PROMPT,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, retry_result_fatal, retry_result_ok, retry_result_transient},
    schema::FieldMap,
};

/// Default API base URL (OpenRouter).
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Default vision model.
pub const DEFAULT_MODEL: &str = "qwen/qwen3-vl-8b-instruct";

/// An error from a single extraction attempt.
#[derive(Debug)]
pub enum ClientError {
    /// The API rejected our credential (HTTP 401).
    Auth(String),

    /// The API rejected our request as malformed (HTTP 400).
    BadRequest(String),

    /// We hit the API's rate limit (HTTP 429).
    RateLimited(String),

    /// Any other non-success HTTP status.
    Api { status: StatusCode, message: String },

    /// A transport-level failure, including request timeouts.
    Network(reqwest::Error),

    /// The card image could not be read.
    Image(anyhow::Error),

    /// The response payload wasn't the JSON object we asked for.
    Malformed(String),
}

impl ClientError {
    /// Is retrying this error worth anything?
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Auth(_) | ClientError::BadRequest(_) | ClientError::Image(_) => {
                false
            }
            ClientError::RateLimited(_) => true,
            ClientError::Api { status, .. } => status.is_known_transient(),
            ClientError::Network(err) => err.is_known_transient(),
            // The model may produce valid JSON on another attempt.
            ClientError::Malformed(_) => true,
        }
    }

    /// Did we hit a rate limit? These get a longer backoff.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::RateLimited(_))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Auth(msg) => write!(f, "API authentication failed: {msg}"),
            ClientError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ClientError::RateLimited(msg) => write!(f, "rate limit reached: {msg}"),
            ClientError::Api { status, message } => {
                write!(f, "API error ({status}): {message}")
            }
            ClientError::Network(err) => write!(f, "network error: {err}"),
            ClientError::Image(err) => write!(f, "unreadable image: {err}"),
            ClientError::Malformed(msg) => write!(f, "malformed model response: {msg}"),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ClientError::Network(err) => Some(err),
            _ => None,
        }
    }
}

/// The result of one extraction attempt.
pub type ExtractResult = RetryResult<(), (), FieldMap, ClientError>;

/// A backend that can extract fields from one card image.
///
/// This is the seam between the retry loop and the actual HTTP client, so
/// tests can substitute a canned backend.
#[async_trait]
pub trait ExtractBackend: Send + Sync + 'static {
    /// Attempt to extract fields from `image`, once.
    async fn extract(&self, image: &Path) -> ExtractResult;
}

/// How [`extract_with_retries`] retries transient failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,

    /// Base backoff. Attempt `n` waits `base_delay × n`, doubled after a
    /// rate-limit response.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Extract fields from `image`, retrying transient failures per `policy`.
pub async fn extract_with_retries(
    backend: &dyn ExtractBackend,
    image: &Path,
    policy: &RetryPolicy,
) -> Result<FieldMap> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match backend.extract(image).await {
            RetryResult::Ok { output, .. } => return Ok(output),
            RetryResult::Fatal { error, .. } => {
                return Err(anyhow!(error.to_string()));
            }
            RetryResult::Transient { error, .. } => {
                if attempt >= policy.max_attempts {
                    return Err(anyhow!(
                        "failed after {} attempts: {}",
                        attempt,
                        error
                    ));
                }
                let mut delay = policy.base_delay * attempt;
                if error.is_rate_limited() {
                    delay *= 2;
                }
                warn!(
                    image = %image.display(),
                    attempt,
                    delay_secs = delay.as_secs_f32(),
                    "attempt failed, will retry: {error}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Configuration for the HTTP backend.
#[derive(Clone, Debug)]
pub struct ClientOpts {
    /// Base URL of the API, without the `/chat/completions` suffix.
    pub api_base: String,

    /// The model to request.
    pub model: String,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Optional proactive request rate limit.
    pub rate_limit: Option<RateLimit>,
}

impl Default for ClientOpts {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            timeout: Duration::from_secs(120),
            rate_limit: None,
        }
    }
}

/// The real backend: talks to an OpenAI-compatible chat completions endpoint.
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    limiter: Option<RateLimiter>,
}

impl HttpBackend {
    /// Create a backend from options and a credential. The credential lives
    /// only in memory and is never persisted.
    pub fn new(opts: &ClientOpts, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", opts.api_base.trim_end_matches('/')),
            model: opts.model.clone(),
            api_key,
            limiter: opts.rate_limit.as_ref().map(RateLimit::to_rate_limiter),
        })
    }
}

#[async_trait]
impl ExtractBackend for HttpBackend {
    #[instrument(level = "debug", skip(self), fields(image = %image.display()))]
    async fn extract(&self, image: &Path) -> ExtractResult {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_one().await;
        }

        let image_url = match image_data_url(image).await {
            Ok(url) => url,
            Err(err) => return retry_result_fatal(ClientError::Image(err)),
        };
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": EXTRACTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } },
                ],
            }],
            "temperature": 0.1,
            "max_tokens": 1000,
        });

        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let error = ClientError::Network(err);
                return if error.is_transient() {
                    retry_result_transient(error)
                } else {
                    retry_result_fatal(error)
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let error = classify_status(status, &body);
            return if error.is_transient() {
                retry_result_transient(error)
            } else {
                retry_result_fatal(error)
            };
        }

        let chat = match serde_json::from_str::<ChatResponse>(&body) {
            Ok(chat) => chat,
            Err(err) => {
                return retry_result_transient(ClientError::Malformed(format!(
                    "unparseable response body: {err}"
                )));
            }
        };
        let Some(choice) = chat.choices.into_iter().next() else {
            return retry_result_transient(ClientError::Malformed(
                "no choices in API response".to_owned(),
            ));
        };
        let content = choice.message.content.unwrap_or_default();
        match parse_field_payload(&content) {
            Ok(fields) => retry_result_ok(fields),
            Err(err) => retry_result_transient(ClientError::Malformed(err)),
        }
    }
}

/// Classify a non-success HTTP status into a [`ClientError`], pulling the
/// API's own error message out of the body when there is one.
fn classify_status(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|body| body.error)
        .map(|detail| detail.message)
        .unwrap_or_else(|| body.trim().to_owned());
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Auth(message),
        StatusCode::BAD_REQUEST => ClientError::BadRequest(message),
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited(message),
        _ => ClientError::Api { status, message },
    }
}

/// Strip a Markdown code fence, which some models wrap around their JSON
/// answer even when told not to.
fn strip_code_fence(content: &str) -> &str {
    let mut content = content.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest;
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest;
    }
    if let Some(rest) = content.strip_suffix("```") {
        content = rest;
    }
    content.trim()
}

/// Parse the model's text payload into a field map. Values that aren't
/// strings are stringified; `null` reads as empty.
fn parse_field_payload(content: &str) -> Result<FieldMap, String> {
    let content = strip_code_fence(content);
    let value = serde_json::from_str::<Value>(content)
        .map_err(|err| format!("payload is not valid JSON: {err}"))?;
    let Value::Object(object) = value else {
        return Err("payload is not a JSON object".to_owned());
    };
    let mut fields = FieldMap::new();
    for (key, value) in object {
        let value = match value {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        fields.insert(key, value);
    }
    Ok(fields)
}

/// The error envelope OpenAI-style APIs wrap failures in.
#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// The slice of the chat completions response we care about.
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Canned backends for tests elsewhere in the crate.
#[cfg(test)]
pub mod testing {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Returns the same fields for every image, and remembers which images
    /// it was asked about.
    pub struct StaticBackend {
        pub fields: FieldMap,
        pub seen: Mutex<Vec<String>>,
    }

    impl StaticBackend {
        pub fn new(fields: FieldMap) -> Arc<Self> {
            Arc::new(Self {
                fields,
                seen: Mutex::new(Vec::new()),
            })
        }

        pub fn seen_filenames(&self) -> Vec<String> {
            let mut seen = self.seen.lock().unwrap().clone();
            seen.sort();
            seen
        }
    }

    #[async_trait]
    impl ExtractBackend for StaticBackend {
        async fn extract(&self, image: &Path) -> ExtractResult {
            let filename = image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.seen.lock().unwrap().push(filename);
            retry_result_ok(self.fields.clone())
        }
    }

    /// Always fails, counting attempts.
    pub struct FailingBackend {
        pub fatal: bool,
        pub calls: AtomicUsize,
    }

    impl FailingBackend {
        pub fn transient() -> Arc<Self> {
            Arc::new(Self {
                fatal: false,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn fatal() -> Arc<Self> {
            Arc::new(Self {
                fatal: true,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtractBackend for FailingBackend {
        async fn extract(&self, _image: &Path) -> ExtractResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                retry_result_fatal(ClientError::Auth("bad credential".to_owned()))
            } else {
                retry_result_transient(ClientError::Malformed(
                    "model returned prose".to_owned(),
                ))
            }
        }
    }
}
