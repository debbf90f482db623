//! OpenAI-compatible chat completions
//!
//! Used for OpenAI, Groq, DeepSeek and a local llama.cpp server.

use serde::{Deserialize, Serialize};

use super::{endpoint, http_client, ChatMessage, CompletionParams, LlmClient, LlmError};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            repeat_penalty: params.repetition_penalty,
        };

        let mut request = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse JSON: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.5,
            max_tokens: 64,
            repeat_penalty: None,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_tokens"], 64);
        assert!(json.get("repeat_penalty").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"{}"}}]}"#).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{}"));
    }
}
