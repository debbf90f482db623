//! LLM bot participant
//!
//! A bot walks a participant's pages like a browser would:
//! - Question pages are sent to the model and the checked answers submitted
//! - Pages without questions are submitted as they are
//! - Wait pages are polled until the other participants catch up
//!
//! The conversation is written to the session database after every
//! exchange with the model.

pub mod page;
pub mod response;

use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::apps::PromptSet;
use crate::db::{queries, Database, DbError};
use crate::interrupt::InterruptFlag;
use crate::llm::{ChatMessage, CompletionParams, LlmClient, LlmError};
use page::{parse_page, Page, PageKind};
use response::{check_answers, correction_prompt, form_values, parse_response, BotResponse, RESPONSE_FORMAT};

/// Attempts per question page before giving up
pub const MAX_ANSWER_ATTEMPTS: usize = 3;
pub const DEFAULT_WAIT_POLL: Duration = Duration::from_secs(3);
pub const DEFAULT_WAIT_LIMIT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_PAGE_LIMIT: usize = 500;

/// Bot errors
#[derive(Error, Debug)]
pub enum BotError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("No usable answer for page {url} after {attempts} attempts: {problems}")]
    InvalidAnswers {
        url: String,
        attempts: usize,
        problems: String,
    },

    #[error("Page {0} has no form to submit")]
    NoForm(String),

    #[error("Still waiting at {url} after {secs}s")]
    WaitTimeout { url: String, secs: u64 },

    #[error("Gave up after {0} pages")]
    PageLimit(usize),

    #[error("Interrupted")]
    Interrupted,
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Http(e.to_string())
    }
}

/// A fetched page: final URL after redirects and its HTML
pub type Fetched = (String, String);

/// How the bot reaches the experiment pages
pub trait Browser {
    fn get(&self, url: &str) -> Result<Fetched, BotError>;
    fn submit(&self, action: &str, fields: &[(String, String)]) -> Result<Fetched, BotError>;
}

/// Browser over HTTP with a cookie jar
pub struct HttpBrowser {
    client: reqwest::blocking::Client,
}

impl HttpBrowser {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client }
    }

    fn read(response: reqwest::blocking::Response) -> Result<Fetched, BotError> {
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(BotError::Http(format!("{} returned {}", url, status)));
        }
        Ok((url, response.text()?))
    }
}

impl Default for HttpBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl Browser for HttpBrowser {
    fn get(&self, url: &str) -> Result<Fetched, BotError> {
        Self::read(self.client.get(url).send()?)
    }

    fn submit(&self, action: &str, fields: &[(String, String)]) -> Result<Fetched, BotError> {
        Self::read(self.client.post(action).form(fields).send()?)
    }
}

/// Everything a bot needs to know about its slot
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub session_id: String,
    pub participant_code: String,
    pub url: String,
    /// Fully qualified model name, recorded with the conversation
    pub model: String,
    pub prompts: PromptSet,
    pub params: CompletionParams,
    pub throttle: bool,
    /// Send the whole conversation on every call instead of a running summary
    pub full_conv_history: bool,
    pub wait_poll: Duration,
    pub wait_limit: Duration,
    pub page_limit: usize,
}

impl BotConfig {
    pub fn new(
        session_id: &str,
        participant_code: &str,
        url: &str,
        model: &str,
        prompts: PromptSet,
        params: CompletionParams,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            participant_code: participant_code.to_string(),
            url: url.to_string(),
            model: model.to_string(),
            prompts,
            params,
            throttle: true,
            full_conv_history: false,
            wait_poll: DEFAULT_WAIT_POLL,
            wait_limit: DEFAULT_WAIT_LIMIT,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Parameters stored next to the conversation
    pub fn bot_parms(&self) -> Value {
        json!({
            "session_id": self.session_id,
            "participant_code": self.participant_code,
            "url": self.url,
            "model": self.model,
            "temperature": self.params.temperature,
            "max_tokens": self.params.max_tokens,
            "throttle": self.throttle,
            "full_conv_history": self.full_conv_history,
            "user_prompts": {
                "system": self.prompts.system,
                "analyze_page_q": self.prompts.analyze_page_q,
            },
        })
    }
}

/// What a finished bot did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotOutcome {
    pub participant_code: String,
    pub pages: usize,
    pub llm_calls: usize,
}

struct BotRun<'a> {
    cfg: &'a BotConfig,
    llm: &'a dyn LlmClient,
    db: &'a Database,
    parms: Value,
    log: Vec<ChatMessage>,
    summary: String,
    /// Text of pages passed since the last question page
    context: Vec<String>,
    llm_calls: usize,
}

impl<'a> BotRun<'a> {
    fn persist(&self) -> Result<(), BotError> {
        self.db.with_connection(|conn| {
            queries::upsert_conversation(
                conn,
                &self.cfg.participant_code,
                &self.cfg.session_id,
                &self.parms,
                &self.log,
            )
        })?;
        Ok(())
    }

    fn page_prompt(&self, page: &Page) -> String {
        let mut body = self.context.join("\n\n");
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&page.body);

        let mut prompt = String::new();
        if !self.cfg.full_conv_history && !self.summary.is_empty() {
            prompt.push_str(&format!("Summary of the experiment so far: {}\n\n", self.summary));
        }
        prompt.push_str(&self.cfg.prompts.render_analyze(&body, &page.questions_json()));
        prompt.push_str("\n\n");
        prompt.push_str(RESPONSE_FORMAT);
        prompt
    }

    /// Messages for the next call
    fn request(&self, pending: &[ChatMessage]) -> Vec<ChatMessage> {
        if self.cfg.full_conv_history {
            self.log.iter().chain(pending).cloned().collect()
        } else {
            std::iter::once(ChatMessage::system(self.cfg.prompts.system.clone()))
                .chain(pending.iter().cloned())
                .collect()
        }
    }

    fn call(&mut self, pending: &mut Vec<ChatMessage>, message: ChatMessage) -> Result<String, BotError> {
        self.log.push(message.clone());
        pending.push(message);

        let reply = self.llm.complete(&self.request(pending), &self.cfg.params)?;
        self.llm_calls += 1;

        self.log.push(ChatMessage::assistant(reply.clone()));
        pending.push(ChatMessage::assistant(reply.clone()));
        self.persist()?;
        Ok(reply)
    }

    /// Ask the model until its answers fit the page
    fn answer(&mut self, page: &Page) -> Result<BotResponse, BotError> {
        let mut pending = Vec::new();
        let mut message = ChatMessage::user(self.page_prompt(page));
        let mut problems = Vec::new();

        for attempt in 1..=MAX_ANSWER_ATTEMPTS {
            let reply = self.call(&mut pending, message)?;

            problems = match parse_response(&reply) {
                Ok(parsed) => {
                    let found = check_answers(&page.questions, &parsed);
                    if found.is_empty() {
                        return Ok(parsed);
                    }
                    found
                }
                Err(e) => vec![e.to_string()],
            };

            warn!(
                "Bot {}: unusable reply on attempt {}/{}: {}",
                self.cfg.participant_code,
                attempt,
                MAX_ANSWER_ATTEMPTS,
                problems.join("; ")
            );
            message = ChatMessage::user(correction_prompt(&problems));
        }

        Err(BotError::InvalidAnswers {
            url: page.url.clone(),
            attempts: MAX_ANSWER_ATTEMPTS,
            problems: problems.join("; "),
        })
    }
}

fn submit_form(browser: &dyn Browser, page: &Page, answers: Vec<(String, String)>) -> Result<Fetched, BotError> {
    let form = page
        .form
        .as_ref()
        .ok_or_else(|| BotError::NoForm(page.url.clone()))?;
    let mut fields = form.hidden.clone();
    fields.extend(answers);
    browser.submit(&form.action, &fields)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Play the experiment as one participant until its last page
pub fn run_bot(
    cfg: &BotConfig,
    llm: &dyn LlmClient,
    browser: &dyn Browser,
    db: &Database,
    interrupt: &InterruptFlag,
) -> Result<BotOutcome, BotError> {
    info!("Bot {} starting at {}", cfg.participant_code, cfg.url);
    db.with_connection(|conn| queries::set_time_in(conn, &cfg.participant_code, &now()))?;

    let mut run = BotRun {
        cfg,
        llm,
        db,
        parms: cfg.bot_parms(),
        log: vec![ChatMessage::system(cfg.prompts.system.clone())],
        summary: String::new(),
        context: Vec::new(),
        llm_calls: 0,
    };
    run.persist()?;

    let (mut url, mut html) = browser.get(&cfg.url)?;
    let mut pages = 0;
    let mut waiting_since: Option<Instant> = None;

    loop {
        if interrupt.is_raised() {
            warn!("Bot {} interrupted at {}", cfg.participant_code, url);
            return Err(BotError::Interrupted);
        }

        let page = parse_page(&url, &html);
        debug!("Bot {} on '{}' ({:?})", cfg.participant_code, page.title, page.kind);

        if page.kind != PageKind::Wait {
            waiting_since = None;
        }

        match page.kind {
            PageKind::Finished => break,
            PageKind::Wait => {
                let started = *waiting_since.get_or_insert_with(Instant::now);
                if started.elapsed() >= cfg.wait_limit {
                    return Err(BotError::WaitTimeout {
                        url,
                        secs: cfg.wait_limit.as_secs(),
                    });
                }
                thread::sleep(cfg.wait_poll);
                (url, html) = browser.get(&url)?;
                continue;
            }
            PageKind::NextOnly => {
                run.context.push(page.body.clone());
                (url, html) = submit_form(browser, &page, Vec::new())?;
            }
            PageKind::Questions => {
                let response = run.answer(&page)?;
                if !response.summary.is_empty() {
                    run.summary = response.summary.clone();
                }
                run.context.clear();
                (url, html) = submit_form(browser, &page, form_values(&page.questions, &response))?;
            }
        }

        pages += 1;
        if pages >= cfg.page_limit {
            return Err(BotError::PageLimit(pages));
        }
    }

    db.with_connection(|conn| queries::set_time_out(conn, &cfg.participant_code, &now()))?;
    info!(
        "Bot {} finished after {} pages and {} model calls",
        cfg.participant_code, pages, run.llm_calls
    );

    Ok(BotOutcome {
        participant_code: cfg.participant_code.clone(),
        pages,
        llm_calls: run.llm_calls,
    })
}
