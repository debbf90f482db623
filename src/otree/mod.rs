//! oTree experiment host
//!
//! This module handles everything that talks to the oTree server:
//! - Session creation and status through the REST API
//! - Participant start URLs and the session monitor URL
//! - The wide CSV data export behind the admin login
//! - Starting and stopping local server processes (`process`)

pub mod process;

use std::fs;
use std::path::Path;
use std::time::Duration;

use lazy_static::lazy_static;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::HostSettings;

const REST_KEY_HEADER: &str = "otree-rest-key";

lazy_static! {
    static ref HIDDEN_INPUT: Selector = Selector::parse("input[type=hidden]").unwrap();
}

/// Experiment host errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Request to oTree failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("oTree API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected oTree response: {0}")]
    Format(String),

    #[error("Session has {found} participants, expected {expected}")]
    ParticipantCount { expected: usize, found: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start {name}: {reason}")]
    ServerStart { name: String, reason: String },
}

/// Participant as reported by the session detail endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub code: String,
    pub id_in_session: u32,
    #[serde(default)]
    pub finished: Option<bool>,
    #[serde(default, rename = "_current_page_name")]
    pub current_page_name: Option<String>,
    #[serde(default, rename = "_current_app_name")]
    pub current_app_name: Option<String>,
}

impl ParticipantStatus {
    pub fn is_finished(&self) -> bool {
        self.finished.unwrap_or(false)
    }
}

/// Session detail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub participants: Vec<ParticipantStatus>,
}

/// The server running the experiment
pub trait ExperimentHost: Send + Sync {
    /// Server base URL without trailing slash
    fn base_url(&self) -> &str;

    /// Create a session and return its code
    fn create_session(
        &self,
        config_name: &str,
        num_participants: usize,
        modified_fields: &Map<String, Value>,
    ) -> Result<String, HostError>;

    fn session_detail(&self, code: &str) -> Result<SessionDetail, HostError>;

    /// Download the wide CSV of all sessions to `path`
    fn export_wide(&self, path: &Path) -> Result<(), HostError>;
}

/// REST client for an oTree server
pub struct OtreeClient {
    client: reqwest::blocking::Client,
    base_url: String,
    settings: HostSettings,
}

impl OtreeClient {
    pub fn new(base_url: &str, settings: HostSettings) -> Self {
        let client = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            settings,
        }
    }

    fn api(&self, method: reqwest::Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}/api/{}", self.base_url, path));
        match &self.settings.rest_key {
            Some(key) => request.header(REST_KEY_HEADER, key),
            None => request,
        }
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, HostError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            Err(HostError::Api { status, body })
        }
    }

    /// Log in to the admin interface when a password is configured
    fn login(&self) -> Result<(), HostError> {
        let Some(password) = &self.settings.admin_password else {
            debug!("No admin password configured, skipping login");
            return Ok(());
        };

        let login_url = format!("{}/login", self.base_url);
        let page = Self::check(self.client.get(&login_url).send()?)?.text()?;

        let mut form = hidden_inputs(&page);
        form.push(("username".to_string(), self.settings.admin_name.clone()));
        form.push(("password".to_string(), password.clone()));

        Self::check(self.client.post(&login_url).form(&form).send()?)?;
        debug!("Logged in to oTree admin as {}", self.settings.admin_name);
        Ok(())
    }
}

impl ExperimentHost for OtreeClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn create_session(
        &self,
        config_name: &str,
        num_participants: usize,
        modified_fields: &Map<String, Value>,
    ) -> Result<String, HostError> {
        let body = json!({
            "session_config_name": config_name,
            "num_participants": num_participants,
            "modified_session_config_fields": modified_fields,
        });

        let response = Self::check(self.api(reqwest::Method::POST, "sessions").json(&body).send()?)?;
        let created: Value = response.json()?;

        created
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HostError::Format("session code missing from response".to_string()))
    }

    fn session_detail(&self, code: &str) -> Result<SessionDetail, HostError> {
        let response = Self::check(
            self.api(reqwest::Method::GET, &format!("sessions/{}", code)).send()?,
        )?;
        let mut detail: SessionDetail = response.json()?;
        if detail.code.is_empty() {
            detail.code = code.to_string();
        }
        Ok(detail)
    }

    fn export_wide(&self, path: &Path) -> Result<(), HostError> {
        self.login()?;
        let response = Self::check(
            self.client
                .get(format!("{}/ExportWide", self.base_url))
                .send()?,
        )?;
        let bytes = response.bytes()?;
        fs::write(path, &bytes)?;
        info!("Wrote oTree wide export ({} bytes) to {}", bytes.len(), path.display());
        Ok(())
    }
}

/// Name/value pairs of the hidden inputs of an HTML form
pub fn hidden_inputs(html: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(html);
    document
        .select(&HIDDEN_INPUT)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Start URL of a participant
pub fn participant_url(base_url: &str, code: &str) -> String {
    format!("{}/InitializeParticipant/{}", base_url.trim_end_matches('/'), code)
}

/// Admin monitor page of a session
pub fn monitor_url(base_url: &str, session_code: &str) -> String {
    format!("{}/SessionMonitor/{}", base_url.trim_end_matches('/'), session_code)
}

/// A freshly created session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// oTree session code
    pub session_id: String,
    /// Participant codes in `id_in_session` order
    pub participant_codes: Vec<String>,
    pub is_human: Vec<bool>,
    pub human_urls: Vec<String>,
    pub bot_urls: Vec<String>,
}

/// Bot slot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSlot {
    pub player_id: u32,
    pub participant_code: String,
    pub url: String,
}

impl SessionHandle {
    /// Bot participants with their 1-based player ids
    pub fn bot_slots(&self) -> Vec<BotSlot> {
        self.participant_codes
            .iter()
            .zip(&self.is_human)
            .enumerate()
            .filter(|(_, (_, human))| !**human)
            .zip(&self.bot_urls)
            .map(|((idx, (code, _)), url)| BotSlot {
                player_id: idx as u32 + 1,
                participant_code: code.clone(),
                url: url.clone(),
            })
            .collect()
    }

    /// Human participants as (player id, start URL)
    pub fn human_slots(&self) -> Vec<(u32, String)> {
        self.is_human
            .iter()
            .enumerate()
            .filter(|(_, human)| **human)
            .map(|(idx, _)| idx as u32 + 1)
            .zip(self.human_urls.iter().cloned())
            .collect()
    }
}

/// Create a session and split its participants into humans and bots
pub fn init_session<H: ExperimentHost + ?Sized>(
    host: &H,
    config_name: &str,
    is_human: &[bool],
    modified_fields: &Map<String, Value>,
) -> Result<SessionHandle, HostError> {
    let code = host.create_session(config_name, is_human.len(), modified_fields)?;
    let mut detail = host.session_detail(&code)?;

    if detail.participants.len() != is_human.len() {
        return Err(HostError::ParticipantCount {
            expected: is_human.len(),
            found: detail.participants.len(),
        });
    }
    detail.participants.sort_by_key(|p| p.id_in_session);

    let participant_codes: Vec<String> = detail.participants.into_iter().map(|p| p.code).collect();
    let mut human_urls = Vec::new();
    let mut bot_urls = Vec::new();
    for (code, human) in participant_codes.iter().zip(is_human) {
        let url = participant_url(host.base_url(), code);
        if *human {
            human_urls.push(url);
        } else {
            bot_urls.push(url);
        }
    }

    info!(
        "Initialized oTree session {} with {} participants",
        code,
        participant_codes.len()
    );

    Ok(SessionHandle {
        session_id: code,
        participant_codes,
        is_human: is_human.to_vec(),
        human_urls,
        bot_urls,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory host; each `session_detail` call pops the next snapshot
    pub struct FakeHost {
        pub participants: usize,
        pub created: Mutex<Vec<(String, usize, Map<String, Value>)>>,
        pub snapshots: Mutex<Vec<Vec<bool>>>,
        pub wide_csv: Option<String>,
    }

    impl FakeHost {
        pub fn new(participants: usize) -> Self {
            Self {
                participants,
                created: Mutex::new(Vec::new()),
                snapshots: Mutex::new(Vec::new()),
                wide_csv: None,
            }
        }

        pub fn with_snapshots(mut self, snapshots: Vec<Vec<bool>>) -> Self {
            self.snapshots = Mutex::new(snapshots);
            self
        }

        pub fn with_wide_csv(mut self, csv: &str) -> Self {
            self.wide_csv = Some(csv.to_string());
            self
        }
    }

    impl ExperimentHost for FakeHost {
        fn base_url(&self) -> &str {
            "http://otree.test"
        }

        fn create_session(
            &self,
            config_name: &str,
            num_participants: usize,
            modified_fields: &Map<String, Value>,
        ) -> Result<String, HostError> {
            self.created.lock().unwrap().push((
                config_name.to_string(),
                num_participants,
                modified_fields.clone(),
            ));
            Ok("sess01".to_string())
        }

        fn session_detail(&self, code: &str) -> Result<SessionDetail, HostError> {
            let finished = {
                let mut snapshots = self.snapshots.lock().unwrap();
                if snapshots.len() > 1 {
                    snapshots.remove(0)
                } else {
                    snapshots.first().cloned().unwrap_or_default()
                }
            };

            // Reverse order to exercise sorting by id_in_session
            let participants = (1..=self.participants)
                .rev()
                .map(|i| ParticipantStatus {
                    code: format!("p{}", i),
                    id_in_session: i as u32,
                    finished: finished.get(i - 1).copied(),
                    current_page_name: Some("Choice".to_string()),
                    current_app_name: Some("rps_repeat".to_string()),
                })
                .collect();

            Ok(SessionDetail {
                code: code.to_string(),
                participants,
            })
        }

        fn export_wide(&self, path: &Path) -> Result<(), HostError> {
            match &self.wide_csv {
                Some(csv) => Ok(fs::write(path, csv)?),
                None => Err(HostError::Api {
                    status: 403,
                    body: "forbidden".to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;

    #[test]
    fn test_init_session_splits_urls() {
        let host = FakeHost::new(3);
        let handle = init_session(&host, "rps_repeat", &[true, false, false], &Map::new()).unwrap();

        assert_eq!(handle.session_id, "sess01");
        assert_eq!(handle.participant_codes, vec!["p1", "p2", "p3"]);
        assert_eq!(handle.human_urls, vec!["http://otree.test/InitializeParticipant/p1"]);
        assert_eq!(handle.bot_urls.len(), 2);

        let bots = handle.bot_slots();
        assert_eq!(bots[0].player_id, 2);
        assert_eq!(bots[1].participant_code, "p3");
        assert_eq!(handle.human_slots(), vec![(1, handle.human_urls[0].clone())]);
    }

    #[test]
    fn test_init_session_count_mismatch() {
        let host = FakeHost::new(1);
        let err = init_session(&host, "rps_repeat", &[true, false], &Map::new()).unwrap_err();
        assert!(matches!(err, HostError::ParticipantCount { expected: 2, found: 1 }));
    }

    #[test]
    fn test_session_detail_parsing() {
        let detail: SessionDetail = serde_json::from_str(
            r#"{"code":"abc","participants":[
                {"code":"x1","id_in_session":1,"finished":null,"_current_page_name":"Choice","label":null},
                {"code":"x2","id_in_session":2,"finished":true}
            ]}"#,
        )
        .unwrap();

        assert!(!detail.participants[0].is_finished());
        assert_eq!(detail.participants[0].current_page_name.as_deref(), Some("Choice"));
        assert!(detail.participants[1].is_finished());
    }

    #[test]
    fn test_hidden_inputs() {
        let html = r#"<form method="post">
            <input type="hidden" name="csrf_token" value="tok">
            <input type="text" name="username">
        </form>"#;
        assert_eq!(hidden_inputs(html), vec![("csrf_token".to_string(), "tok".to_string())]);
    }

    #[test]
    fn test_urls() {
        assert_eq!(monitor_url("http://localhost:8000/", "abc"), "http://localhost:8000/SessionMonitor/abc");
        assert_eq!(participant_url("http://localhost:8000", "p1"), "http://localhost:8000/InitializeParticipant/p1");
    }
}
