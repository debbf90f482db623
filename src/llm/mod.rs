//! LLM provider clients
//!
//! All providers sit behind the blocking [`LlmClient`] trait:
//! - OpenAI-compatible chat completions (OpenAI, Groq, DeepSeek, llama.cpp)
//! - Anthropic messages
//! - Gemini generateContent
//!
//! [`Throttled`] wraps any client with retry and exponential backoff.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::{ModelSpec, Provider};
pub use crate::models::conversation::{ChatMessage, MessageRole};

use anthropic::AnthropicClient;
use gemini::GeminiClient;
use openai::OpenAiClient;

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Missing API key: {0}")]
    MissingApiKey(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Request(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Request(e.to_string())
    }
}

/// Sampling parameters of a completion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub repetition_penalty: Option<f32>,
}

impl CompletionParams {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            repetition_penalty: None,
        }
    }

    /// Tuning for small local models that tend to ramble and repeat
    pub fn for_local_model(&self) -> Self {
        Self {
            temperature: self.temperature.max(0.8),
            max_tokens: self.max_tokens.min(256),
            repetition_penalty: Some(1.1),
        }
    }
}

/// A chat model
pub trait LlmClient: Send + Sync {
    /// Model name sent to the provider
    fn model(&self) -> &str;

    /// Complete a conversation and return the assistant text
    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError>;
}

impl<C: LlmClient + ?Sized> LlmClient for Box<C> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError> {
        (**self).complete(messages, params)
    }
}

/// Backoff schedule for throttled clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Client wrapper retrying rate limits, server errors and transport failures
pub struct Throttled<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: LlmClient> Throttled<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<C: LlmClient> LlmClient for Throttled<C> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError> {
        let mut attempt = 1;
        loop {
            match self.inner.complete(messages, params) {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "Throttling {}: attempt {}/{} failed ({}), retrying in {:?}",
                        self.inner.model(),
                        attempt,
                        self.policy.max_attempts,
                        e,
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shared blocking HTTP client
pub(crate) fn http_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new())
}

/// Build the client for a registry model
pub fn client_for(
    spec: &ModelSpec,
    api_key: Option<String>,
    local_url: &str,
    throttle: bool,
) -> Result<Box<dyn LlmClient>, LlmError> {
    let require_key = || {
        api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(spec.api_key_env.clone().unwrap_or_default()))
    };

    let client: Box<dyn LlmClient> = match spec.provider {
        Provider::Gemini => Box::new(GeminiClient::new(
            Provider::Gemini.base_url().unwrap_or_default(),
            &spec.name,
            require_key()?,
        )),
        Provider::Anthropic => Box::new(AnthropicClient::new(
            Provider::Anthropic.base_url().unwrap_or_default(),
            &spec.name,
            require_key()?,
        )),
        Provider::OpenAi | Provider::Groq | Provider::DeepSeek => Box::new(OpenAiClient::new(
            spec.provider.base_url().unwrap_or_default(),
            &spec.name,
            Some(require_key()?),
        )),
        Provider::Local => Box::new(OpenAiClient::new(
            &format!("{}/v1", local_url.trim_end_matches('/')),
            &spec.name,
            None,
        )),
    };

    if throttle {
        Ok(Box::new(Throttled::new(client, RetryPolicy::default())))
    } else {
        Ok(client)
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedClient;
    use super::*;

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_throttled_retries_rate_limits() {
        let inner = ScriptedClient::new(vec![
            Err(LlmError::Api { status: 429, body: "slow down".into() }),
            Err(LlmError::Request("reset".into())),
            Ok("done".into()),
        ]);
        let client = Throttled::new(inner, instant());

        let reply = client.complete(&[ChatMessage::user("hi")], &CompletionParams::new(0.7, 10));
        assert_eq!(reply.unwrap(), "done");
        assert_eq!(client.inner.call_count(), 3);
    }

    #[test]
    fn test_throttled_gives_up() {
        let replies = (0..6)
            .map(|_| Err(LlmError::Api { status: 503, body: String::new() }))
            .collect();
        let client = Throttled::new(ScriptedClient::new(replies), instant());

        assert!(client.complete(&[], &CompletionParams::new(0.7, 10)).is_err());
        assert_eq!(client.inner.call_count(), 5);
    }

    #[test]
    fn test_throttled_does_not_retry_client_errors() {
        let inner = ScriptedClient::new(vec![Err(LlmError::Api { status: 401, body: String::new() })]);
        let client = Throttled::new(inner, instant());

        assert!(client.complete(&[], &CompletionParams::new(0.7, 10)).is_err());
        assert_eq!(client.inner.call_count(), 1);
    }

    #[test]
    fn test_local_params() {
        let params = CompletionParams::new(0.2, 1024).for_local_model();
        assert_eq!(params.temperature, 0.8);
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.repetition_penalty, Some(1.1));

        let params = CompletionParams::new(1.0, 100).for_local_model();
        assert_eq!(params.temperature, 1.0);
        assert_eq!(params.max_tokens, 100);
    }

    #[test]
    fn test_client_for_requires_key() {
        let spec = ModelSpec::new(Provider::Gemini, "gemini-1.5-flash");
        let err = client_for(&spec, None, "http://localhost:8080", true).err().unwrap();
        assert!(matches!(err, LlmError::MissingApiKey(ref k) if k == "GOOGLE_API_KEY"));

        let local = ModelSpec::new(Provider::Local, "tinyllama");
        let client = client_for(&local, None, "http://localhost:8080/", false).unwrap();
        assert_eq!(client.model(), "tinyllama");
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(endpoint("http://x/v1/", "/chat/completions"), "http://x/v1/chat/completions");
    }
}
