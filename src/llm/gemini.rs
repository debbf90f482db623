//! Gemini generateContent API

use serde::{Deserialize, Serialize};

use super::{endpoint, http_client, ChatMessage, CompletionParams, LlmClient, LlmError, MessageRole};

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Deserialize)]
struct GeminiCandidatePart {
    #[serde(default)]
    text: String,
}

pub struct GeminiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: String) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.to_string(),
            model: model.trim().to_string(),
            api_key,
        }
    }
}

fn build_request(messages: &[ChatMessage], params: &CompletionParams) -> GeminiRequest {
    let system: Vec<GeminiPart> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| GeminiPart { text: m.content.clone() })
        .collect();

    let contents = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| GeminiContent {
            parts: vec![GeminiPart { text: m.content.clone() }],
            role: Some(if m.role == MessageRole::Assistant { "model" } else { "user" }.to_string()),
        })
        .collect();

    GeminiRequest {
        contents,
        system_instruction: if system.is_empty() {
            None
        } else {
            Some(GeminiContent { parts: system, role: None })
        },
        generation_config: GenerationConfig {
            temperature: params.temperature,
            max_output_tokens: params.max_tokens,
        },
    }
}

impl LlmClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, messages: &[ChatMessage], params: &CompletionParams) -> Result<String, LlmError> {
        let url = format!(
            "{}?key={}",
            endpoint(&self.base_url, &format!("models/{}:generateContent", self.model)),
            urlencoding::encode(&self.api_key)
        );

        let response = self
            .client
            .post(&url)
            .json(&build_request(messages, params))
            .send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed: GeminiResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse JSON: {}", e)))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(LlmError::InvalidResponse("no candidates in response".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_mapped() {
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user("page"),
            ChatMessage::assistant("{}"),
        ];
        let json = serde_json::to_value(build_request(&messages, &CompletionParams::new(0.7, 512))).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "rules");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn test_response_parsing() {
        let parsed: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]}}]}"#,
        )
        .unwrap();
        let text: String = parsed.candidates[0].content.parts.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(text, r#"{"a":1}"#);
    }
}
