//! oTree page parsing
//!
//! Turns the HTML of a participant page into:
//! - The visible text (scripts and styles removed)
//! - The form to submit, with its hidden inputs
//! - The questions asked, with labels and answer options
//! - A page kind telling the bot what to do next

use std::collections::HashMap;

use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

/// Marker of the page oTree shows after the last page
pub const FINISHED_MARKER: &str = "OutOfRangeNotification";

lazy_static! {
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref BODY: Selector = Selector::parse("body").unwrap();
    static ref FORM: Selector = Selector::parse("form").unwrap();
    static ref FIELDS: Selector = Selector::parse("input, select, textarea").unwrap();
    static ref OPTION: Selector = Selector::parse("option").unwrap();
    static ref LABEL: Selector = Selector::parse("label[for]").unwrap();
    static ref SUBMIT: Selector =
        Selector::parse("button, input[type=submit]").unwrap();
    static ref WAIT_MARKER: Selector =
        Selector::parse(".otree-wait-page, #otree-wait-page, .otree-wait-page__body").unwrap();
}

/// What the bot does with a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Ask the model and submit answers
    Questions,
    /// Submit the form without answers
    NextOnly,
    /// Wait for other participants
    Wait,
    /// The experiment is over
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Radio,
    Select,
    Text,
    Number,
    Textarea,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerOption {
    pub value: String,
    pub label: String,
}

/// A form field the participant has to fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub id: String,
    pub label: String,
    pub kind: QuestionKind,
    pub options: Vec<AnswerOption>,
}

impl Question {
    /// Option matching an answer by value or label, ignoring case
    pub fn find_option(&self, answer: &str) -> Option<&AnswerOption> {
        let answer = answer.trim();
        self.options
            .iter()
            .find(|o| o.value.eq_ignore_ascii_case(answer))
            .or_else(|| self.options.iter().find(|o| o.label.eq_ignore_ascii_case(answer)))
    }

    pub fn has_options(&self) -> bool {
        matches!(self.kind, QuestionKind::Radio | QuestionKind::Select)
    }
}

/// The submit target of a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageForm {
    /// Absolute URL to post to
    pub action: String,
    pub hidden: Vec<(String, String)>,
}

/// A parsed participant page
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub title: String,
    pub body: String,
    pub form: Option<PageForm>,
    pub questions: Vec<Question>,
    pub kind: PageKind,
}

impl Page {
    /// Questions in the JSON shape shown to the model
    pub fn questions_json(&self) -> String {
        let items: Vec<serde_json::Value> = self
            .questions
            .iter()
            .map(|q| {
                let mut item = serde_json::json!({
                    "question_id": q.id,
                    "question_type": q.kind,
                    "question_label": q.label,
                });
                if q.has_options() {
                    item["answer_choices"] = q
                        .options
                        .iter()
                        .map(|o| {
                            if o.label == o.value {
                                o.value.clone()
                            } else {
                                format!("{} ({})", o.value, o.label)
                            }
                        })
                        .collect();
                }
                item
            })
            .collect();

        serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string())
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of the body, one line per text fragment
fn visible_text(document: &Html) -> String {
    let Some(body) = document.select(&BODY).next() else {
        return String::new();
    };

    body.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map_or(false, |e| matches!(e.name(), "script" | "style" | "noscript"))
            });
            if hidden {
                return None;
            }
            let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.is_empty() {
                None
            } else {
                Some(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve a form action against the page URL
fn resolve_action(page_url: &str, action: Option<&str>) -> String {
    match action.map(str::trim).filter(|a| !a.is_empty()) {
        None => page_url.to_string(),
        Some(action) => reqwest::Url::parse(page_url)
            .and_then(|base| base.join(action))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| action.to_string()),
    }
}

fn parse_questions(form: ElementRef<'_>, labels: &HashMap<String, String>) -> Vec<Question> {
    let mut questions: Vec<Question> = Vec::new();

    let label_for = |id: Option<&str>| id.and_then(|id| labels.get(id)).cloned();

    for field in form.select(&FIELDS) {
        let el = field.value();
        let Some(name) = el.attr("name") else {
            continue;
        };
        let field_label = label_for(Some(format!("id_{}", name).as_str()))
            .or_else(|| label_for(el.attr("id")))
            .unwrap_or_else(|| name.to_string());

        match el.name() {
            "select" => {
                let options = field
                    .select(&OPTION)
                    .filter_map(|o| {
                        let value = o.value().attr("value").unwrap_or_default().trim().to_string();
                        if value.is_empty() {
                            return None;
                        }
                        let label = element_text(o);
                        Some(AnswerOption {
                            label: if label.is_empty() { value.clone() } else { label },
                            value,
                        })
                    })
                    .collect();
                questions.push(Question {
                    id: name.to_string(),
                    label: field_label,
                    kind: QuestionKind::Select,
                    options,
                });
            }
            "textarea" => questions.push(Question {
                id: name.to_string(),
                label: field_label,
                kind: QuestionKind::Textarea,
                options: Vec::new(),
            }),
            _ => {
                let input_type = el.attr("type").unwrap_or("text").to_ascii_lowercase();
                match input_type.as_str() {
                    "radio" => {
                        let value = el.attr("value").unwrap_or_default().to_string();
                        let option_label = label_for(el.attr("id"))
                            .or_else(|| {
                                field
                                    .parent()
                                    .and_then(ElementRef::wrap)
                                    .filter(|p| p.value().name() == "label")
                                    .map(element_text)
                            })
                            .filter(|l| !l.is_empty())
                            .unwrap_or_else(|| value.clone());
                        let option = AnswerOption { value, label: option_label };

                        if let Some(existing) = questions.iter_mut().find(|q| q.id == name) {
                            existing.options.push(option);
                        } else {
                            questions.push(Question {
                                id: name.to_string(),
                                label: label_for(Some(format!("id_{}", name).as_str()))
                                    .unwrap_or_else(|| name.to_string()),
                                kind: QuestionKind::Radio,
                                options: vec![option],
                            });
                        }
                    }
                    "text" | "email" => questions.push(Question {
                        id: name.to_string(),
                        label: field_label,
                        kind: QuestionKind::Text,
                        options: Vec::new(),
                    }),
                    "number" => questions.push(Question {
                        id: name.to_string(),
                        label: field_label,
                        kind: QuestionKind::Number,
                        options: Vec::new(),
                    }),
                    _ => {}
                }
            }
        }
    }

    questions
}

/// Parse a participant page
pub fn parse_page(url: &str, html: &str) -> Page {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(element_text)
        .unwrap_or_default();
    let body = visible_text(&document);

    let labels: HashMap<String, String> = document
        .select(&LABEL)
        .filter_map(|l| {
            let target = l.value().attr("for")?;
            Some((target.to_string(), element_text(l)))
        })
        .collect();

    let form_el = document.select(&FORM).next();
    let form = form_el.map(|f| PageForm {
        action: resolve_action(url, f.value().attr("action")),
        hidden: f
            .select(&FIELDS)
            .filter(|i| i.value().name() == "input" && i.value().attr("type") == Some("hidden"))
            .filter_map(|i| {
                let name = i.value().attr("name")?;
                Some((name.to_string(), i.value().attr("value").unwrap_or_default().to_string()))
            })
            .collect(),
    });
    let questions = form_el
        .map(|f| parse_questions(f, &labels))
        .unwrap_or_default();
    let has_submit = form_el.map_or(false, |f| f.select(&SUBMIT).next().is_some());

    let is_wait = document.select(&WAIT_MARKER).next().is_some()
        || title.to_lowercase().contains("please wait");

    let kind = if url.contains(FINISHED_MARKER) || html.contains(FINISHED_MARKER) {
        PageKind::Finished
    } else if is_wait {
        PageKind::Wait
    } else if !questions.is_empty() {
        PageKind::Questions
    } else if form.is_some() && has_submit {
        PageKind::NextOnly
    } else {
        PageKind::Wait
    };

    Page {
        url: url.to_string(),
        title,
        body,
        form,
        questions,
        kind,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const CHOICE_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>Round 2 of 3</title><style>.x { color: red }</style></head>
<body>
  <h2>Round 2 of 3</h2>
  <p>Choose your move.</p>
  <script>var secret = 1;</script>
  <form method="post" action="" id="form">
    <input type="hidden" name="csrf_token" value="abc">
    <label class="col-form-label" for="id_choice">Your choice</label>
    <div class="form-check">
      <input type="radio" name="choice" id="id_choice-0" value="R">
      <label for="id_choice-0">Rock</label>
    </div>
    <div class="form-check">
      <input type="radio" name="choice" id="id_choice-1" value="P">
      <label for="id_choice-1">Paper</label>
    </div>
    <div class="form-check">
      <label><input type="radio" name="choice" id="id_choice-2" value="S"> Scissors</label>
    </div>
    <label for="id_confidence">How confident are you?</label>
    <input type="number" name="confidence" id="id_confidence">
    <button class="otree-btn-next btn btn-primary">Next</button>
  </form>
</body></html>"#;

    pub const RESULTS_PAGE: &str = r#"<html><head><title>Results</title></head><body>
  <p>Round 2 result: You chose Rock, opponent chose Scissors. You win.</p>
  <form method="post"><button class="otree-btn-next">Next</button></form>
</body></html>"#;

    pub const WAIT_PAGE: &str = r#"<html><head><title>Please wait</title></head><body>
  <div class="otree-wait-page">Waiting for the other participant.</div>
</body></html>"#;

    pub const FINISHED_PAGE: &str = r#"<html><head><title>Done</title></head><body>
  <p>OutOfRangeNotification</p></body></html>"#;
}
