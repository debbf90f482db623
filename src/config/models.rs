//! Model registry
//!
//! The set of LLMs a roster may reference is declared through environment
//! variables holding comma-separated model names, one variable per provider.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// LLM provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Anthropic,
    Groq,
    DeepSeek,
    Local,
}

impl Provider {
    /// Providers in registration order; later ones override earlier ones
    pub fn all() -> Vec<Provider> {
        vec![
            Provider::Gemini,
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Groq,
            Provider::DeepSeek,
            Provider::Local,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Groq => "groq",
            Provider::DeepSeek => "deepseek",
            Provider::Local => "local",
        }
    }

    /// Variable listing the models of this provider
    pub fn models_env(&self) -> &'static str {
        match self {
            Provider::Gemini => "GOOGLE_MODELS",
            Provider::OpenAi => "OPENAI_MODELS",
            Provider::Anthropic => "ANTHROPIC_MODELS",
            Provider::Groq => "GROQ_MODELS",
            Provider::DeepSeek => "DEEPSEEK_MODELS",
            Provider::Local => "LOCAL_LLM_MODELS",
        }
    }

    /// Variable holding the API key, if the provider needs one
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::Gemini => Some("GOOGLE_API_KEY"),
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
            Provider::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Provider::Local => None,
        }
    }

    /// Models assumed when the variable is unset
    fn default_models(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini-1.5-flash",
            _ => "",
        }
    }

    /// Fully qualified model name as recorded in bot parameters
    pub fn full_name(&self, model: &str) -> String {
        match self {
            Provider::Gemini => format!("gemini/{}", model),
            Provider::OpenAi => model.to_string(),
            Provider::Anthropic => format!("anthropic/{}", model),
            Provider::Groq => format!("groq/{}", model),
            Provider::DeepSeek => format!("deepseek/{}", model),
            Provider::Local => "llamacpp".to_string(),
        }
    }

    /// Base URL of the hosted API; local models use the llama.cpp URL
    pub fn base_url(&self) -> Option<&'static str> {
        match self {
            Provider::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Groq => Some("https://api.groq.com/openai/v1"),
            Provider::DeepSeek => Some("https://api.deepseek.com/v1"),
            Provider::Local => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model a roster may reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Name used in `player_models.csv`
    pub name: String,
    pub full_name: String,
    pub provider: Provider,
    pub api_key_env: Option<String>,
}

impl ModelSpec {
    pub fn new(provider: Provider, name: &str) -> Self {
        Self {
            name: name.to_string(),
            full_name: provider.full_name(name),
            provider,
            api_key_env: provider.api_key_env().map(str::to_string),
        }
    }

    pub fn is_local(&self) -> bool {
        self.provider == Provider::Local
    }
}

/// All available models keyed by name
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Build the registry from a variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut models = BTreeMap::new();

        for provider in Provider::all() {
            let raw = lookup(provider.models_env())
                .unwrap_or_else(|| provider.default_models().to_string());

            for name in raw.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                models.insert(name.to_string(), ModelSpec::new(provider, name));
            }
        }

        Self { models }
    }

    /// Build the registry from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn registry(vars: &[(&str, &str)]) -> ModelRegistry {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ModelRegistry::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_default_gemini_model() {
        let reg = registry(&[]);
        assert_eq!(reg.len(), 1);
        let spec = reg.get("gemini-1.5-flash").unwrap();
        assert_eq!(spec.full_name, "gemini/gemini-1.5-flash");
        assert_eq!(spec.api_key_env.as_deref(), Some("GOOGLE_API_KEY"));
    }

    #[test]
    fn test_full_names_per_provider() {
        let reg = registry(&[
            ("OPENAI_MODELS", "gpt-4o-mini, gpt-4o"),
            ("ANTHROPIC_MODELS", "claude-3-haiku"),
            ("GROQ_MODELS", "llama3-8b"),
            ("DEEPSEEK_MODELS", "deepseek-chat"),
            ("LOCAL_LLM_MODELS", "tinyllama,"),
        ]);

        assert_eq!(reg.get("gpt-4o").unwrap().full_name, "gpt-4o");
        assert_eq!(reg.get("claude-3-haiku").unwrap().full_name, "anthropic/claude-3-haiku");
        assert_eq!(reg.get("llama3-8b").unwrap().full_name, "groq/llama3-8b");
        assert_eq!(reg.get("deepseek-chat").unwrap().full_name, "deepseek/deepseek-chat");

        let local = reg.get("tinyllama").unwrap();
        assert_eq!(local.full_name, "llamacpp");
        assert!(local.api_key_env.is_none());
        assert!(local.is_local());
        assert_eq!(reg.len(), 7);
    }

    #[test]
    fn test_later_provider_overrides() {
        let reg = registry(&[("GOOGLE_MODELS", "shared"), ("LOCAL_LLM_MODELS", "shared")]);
        assert_eq!(reg.get("shared").unwrap().provider, Provider::Local);
    }

    #[test]
    fn test_empty_google_models_disables_default() {
        let reg = registry(&[("GOOGLE_MODELS", "")]);
        assert!(reg.is_empty());
    }
}
