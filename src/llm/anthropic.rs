//! Anthropic messages API

use serde::{Deserialize, Serialize};

use super::{endpoint, http_client, ChatMessage, CompletionParams, LlmClient, LlmError, MessageRole};

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(base_url: &str, model: &str, api_key: String) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

/// System prompts travel outside the message list
fn build_request<'a>(model: &'a str, messages: &'a [ChatMessage], params: &CompletionParams) -> MessagesRequest<'a> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    MessagesRequest {
        model,
        system: if system.is_empty() { None } else { Some(system.join("\n\n")) },
        messages: messages.iter().filter(|m| m.role != MessageRole::System).collect(),
        max_tokens: params.max_tokens,
        temperature: params.temperature,
    }
}

impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError> {
        let body = build_request(&self.model, messages, params);

        let response = self
            .client
            .post(endpoint(&self.base_url, "messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed: MessagesResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse JSON: {}", e)))?;

        let text: String = parsed.content.into_iter().filter_map(|b| b.text).collect();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse("empty content".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_extracted() {
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user("page"),
            ChatMessage::assistant("{}"),
        ];
        let request = build_request("claude-3-haiku", &messages, &CompletionParams::new(0.7, 100));
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["system"], "rules");
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
