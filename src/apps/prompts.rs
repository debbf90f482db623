//! Per-app prompt sets
//!
//! Each app ships a `prompts.json`:
//!
//! ```json
//! {
//!   "default": { "system": "...", "analyze_page_q": "... {body} ... {questions_json}" },
//!   "roles": {
//!     "P5": { "system": "...", "analyze_page_q": "...", "description": "..." }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::roster::Roster;

/// Placeholder replaced by the page text
pub const BODY_PLACEHOLDER: &str = "{body}";
/// Placeholder replaced by the JSON list of questions
pub const QUESTIONS_PLACEHOLDER: &str = "{questions_json}";

const LOCAL_BREVITY_SUFFIX: &str =
    "\n\nIMPORTANT: Your responses must be extremely brief and concise.";

const BASIC_SYSTEM: &str =
    "You are participating in an experiment. Always respond in valid JSON format only.";
const BASIC_ANALYZE: &str =
    "Page content: {body}\nQuestions: {questions_json}\nRespond with valid JSON only.";

/// Prompt errors
#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid prompts file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Prompts handed to one bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    pub system: String,
    pub analyze_page_q: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PromptSet {
    /// Generic prompts used when an app provides none
    pub fn builtin() -> Self {
        Self {
            system: BASIC_SYSTEM.to_string(),
            analyze_page_q: BASIC_ANALYZE.to_string(),
            description: None,
        }
    }

    /// Copy with the brevity instruction appended to every prompt
    pub fn for_local_model(&self) -> Self {
        Self {
            system: format!("{}{}", self.system, LOCAL_BREVITY_SUFFIX),
            analyze_page_q: format!("{}{}", self.analyze_page_q, LOCAL_BREVITY_SUFFIX),
            description: self.description.clone(),
        }
    }

    /// Fill the page analysis template
    pub fn render_analyze(&self, body: &str, questions_json: &str) -> String {
        // Questions first so page text containing "{questions_json}" stays verbatim
        self.analyze_page_q
            .replace(QUESTIONS_PLACEHOLDER, questions_json)
            .replace(BODY_PLACEHOLDER, body)
    }
}

/// All prompt sets of an app
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptBook {
    #[serde(default)]
    pub default: Option<PromptSet>,
    #[serde(default)]
    pub roles: BTreeMap<String, PromptSet>,
}

impl PromptBook {
    /// Load a prompt book from a JSON file
    pub fn load(path: &Path) -> Result<Self, PromptError> {
        let text = fs::read_to_string(path).map_err(|source| PromptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let book = Self::from_json(&text)?;
        debug!(
            "Loaded {} role prompt sets from {}",
            book.roles.len(),
            path.display()
        );
        Ok(book)
    }

    pub fn from_json(text: &str) -> Result<Self, PromptError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn available_roles(&self) -> Vec<&str> {
        self.roles.keys().map(String::as_str).collect()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Human-readable description of a role
    pub fn role_description(&self, role: &str) -> String {
        match self.roles.get(role) {
            Some(set) => set
                .description
                .clone()
                .unwrap_or_else(|| format!("Prompt set {}", role)),
            None => format!("Unknown role: {}", role),
        }
    }

    /// Pick the prompts for a role
    ///
    /// Falls back to the default set, then to the built-in basic prompts.
    pub fn resolve(&self, role: Option<&str>) -> PromptSet {
        if let Some(role) = role {
            if let Some(set) = self.roles.get(role) {
                return set.clone();
            }
            warn!("No prompts for role '{}', trying default", role);
        }

        match &self.default {
            Some(set) => set.clone(),
            None => {
                warn!("No default prompts found, using basic prompts");
                PromptSet::builtin()
            }
        }
    }

    /// Roster roles this book does not define, by player id
    pub fn unknown_roles(&self, roster: &Roster) -> Vec<(u32, String)> {
        roster
            .roles()
            .into_iter()
            .filter(|(_, role)| !self.has_role(role))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOK: &str = r#"{
        "default": {"system": "default system", "analyze_page_q": "D {body} {questions_json}"},
        "roles": {
            "P5": {"system": "p5 system", "analyze_page_q": "P5 {body}", "description": "Theory of mind"}
        }
    }"#;

    #[test]
    fn test_resolve_role_then_default() {
        let book = PromptBook::from_json(BOOK).unwrap();

        assert_eq!(book.resolve(Some("P5")).system, "p5 system");
        assert_eq!(book.resolve(Some("P9")).system, "default system");
        assert_eq!(book.resolve(None).system, "default system");
    }

    #[test]
    fn test_resolve_builtin_when_empty() {
        let book = PromptBook::from_json(r#"{"roles": {}}"#).unwrap();
        assert_eq!(book.resolve(None), PromptSet::builtin());
    }

    #[test]
    fn test_role_description() {
        let book = PromptBook::from_json(BOOK).unwrap();
        assert_eq!(book.role_description("P5"), "Theory of mind");
        assert_eq!(book.role_description("X"), "Unknown role: X");
        assert_eq!(book.available_roles(), vec!["P5"]);
    }

    #[test]
    fn test_render_analyze() {
        let set = PromptBook::from_json(BOOK).unwrap().resolve(None);
        assert_eq!(set.render_analyze("page text", "[]"), "D page text []");
    }

    #[test]
    fn test_local_model_suffix() {
        let set = PromptSet::builtin().for_local_model();
        assert!(set.system.ends_with("extremely brief and concise."));
        assert!(set.analyze_page_q.ends_with("extremely brief and concise."));
        assert!(set.analyze_page_q.contains(BODY_PLACEHOLDER));
    }

    #[test]
    fn test_unknown_roles() {
        let book = PromptBook::from_json(BOOK).unwrap();
        let roster =
            Roster::from_reader("player_id,model_name,role\n1,human,P5\n2,gemini-1.5-flash,P7\n".as_bytes())
                .unwrap();
        assert_eq!(book.unknown_roles(&roster), vec![(2, "P7".to_string())]);
    }
}
