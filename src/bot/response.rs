//! Model reply handling
//!
//! Replies are JSON objects, optionally wrapped in a markdown code fence:
//!
//! ```json
//! {"summary": "...", "answers": {"choice": {"answer": "R", "reason": "..."}}}
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use super::page::{Question, QuestionKind};

/// Output format appended to every page prompt
pub const RESPONSE_FORMAT: &str = r#"Respond with a single JSON object of this form:
{"summary": "<short summary of the experiment so far>", "answers": {"<question_id>": {"answer": "<your answer>", "reason": "<short reason>"}}}
Answer every question listed above using its question_id. For questions with answer choices, answer with one of the choices."#;

/// Opening of every correction message
pub const CORRECTION_PREFIX: &str = "Your previous reply could not be used";

/// Reply parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Reply does not contain a JSON object")]
    NoJson,

    #[error("Reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Reply has no answers object")]
    NoAnswers,
}

/// One answer with the model's reasoning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerEntry {
    pub answer: String,
    pub reason: String,
}

/// A parsed model reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotResponse {
    pub summary: String,
    pub answers: BTreeMap<String, AnswerEntry>,
}

/// The JSON object inside a reply, tolerating code fences and chatter
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&reply[start..=end])
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a model reply
pub fn parse_response(reply: &str) -> Result<BotResponse, ResponseError> {
    let json = extract_json(reply).ok_or(ResponseError::NoJson)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| ResponseError::InvalidJson(e.to_string()))?;

    let summary = value.get("summary").map(scalar_text).unwrap_or_default();
    let answers = value
        .get("answers")
        .and_then(Value::as_object)
        .ok_or(ResponseError::NoAnswers)?
        .iter()
        .map(|(id, entry)| {
            let parsed = match entry {
                Value::Object(fields) => AnswerEntry {
                    answer: fields.get("answer").map(scalar_text).unwrap_or_default(),
                    reason: fields.get("reason").map(scalar_text).unwrap_or_default(),
                },
                other => AnswerEntry {
                    answer: scalar_text(other),
                    reason: String::new(),
                },
            };
            (id.clone(), parsed)
        })
        .collect();

    Ok(BotResponse { summary, answers })
}

/// Problems with the answers given to a page's questions
pub fn check_answers(questions: &[Question], response: &BotResponse) -> Vec<String> {
    let mut problems = Vec::new();

    for question in questions {
        let Some(entry) = response.answers.get(&question.id) else {
            problems.push(format!("Question '{}' was not answered.", question.id));
            continue;
        };

        if entry.answer.is_empty() {
            problems.push(format!("The answer to '{}' is empty.", question.id));
            continue;
        }

        match question.kind {
            QuestionKind::Radio | QuestionKind::Select => {
                if question.find_option(&entry.answer).is_none() {
                    let choices: Vec<&str> = question.options.iter().map(|o| o.value.as_str()).collect();
                    problems.push(format!(
                        "The answer '{}' to '{}' is not one of: {}.",
                        entry.answer,
                        question.id,
                        choices.join(", ")
                    ));
                }
            }
            QuestionKind::Number => {
                if entry.answer.parse::<f64>().is_err() {
                    problems.push(format!("The answer to '{}' must be a number.", question.id));
                }
            }
            QuestionKind::Text | QuestionKind::Textarea => {}
        }
    }

    problems
}

/// Follow-up message asking the model to fix its reply
pub fn correction_prompt(problems: &[String]) -> String {
    format!(
        "{}:\n- {}\n\n{}",
        CORRECTION_PREFIX,
        problems.join("\n- "),
        RESPONSE_FORMAT
    )
}

/// Form values for the answers, mapping choices to option values
pub fn form_values(questions: &[Question], response: &BotResponse) -> Vec<(String, String)> {
    questions
        .iter()
        .filter_map(|q| {
            let entry = response.answers.get(&q.id)?;
            let value = if q.has_options() {
                q.find_option(&entry.answer)?.value.clone()
            } else {
                entry.answer.clone()
            };
            Some((q.id.clone(), value))
        })
        .collect()
}
