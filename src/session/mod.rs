//! Session orchestration
//!
//! One session runs these steps in order:
//! 1. Create the output directory and the conversation log
//! 2. Warn about roles the app's prompts do not define
//! 3. Build the modified session config fields
//! 4. Create the oTree session and record its participants
//! 5. Run one thread per bot and join them
//! 6. Wait for human participants to finish
//! 7. Export the data; each export step logs and continues on failure
//!
//! `run_sessions` runs several sessions side by side, one thread each.

pub mod browser;
pub mod monitor;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::apps::{PromptBook, Roster};
use crate::bot::{run_bot, BotConfig, BotOutcome, Browser, HttpBrowser};
use crate::config::{ModelRegistry, ModelSpec};
use crate::db::{db_file_name, queries, Database, DbError};
use crate::export::normalize::normalize_file;
use crate::export::responses::export_responses;
use crate::export::summary::{tally_choices, ExportSummary};
use crate::export::{export_participants, SessionFiles, Table};
use crate::game::ChoiceTally;
use crate::interrupt::InterruptFlag;
use crate::llm::{client_for, CompletionParams, LlmClient, LlmError};
use crate::models::participant::ParticipantRecord;
use crate::otree::process::{ensure_llamacpp, health_ok, LlamaCppOptions, ManagedServer};
use crate::otree::{init_session, monitor_url, ExperimentHost, HostError, SessionHandle};
use crate::report;
use monitor::{wait_for_completion, WaitOutcome};

/// Default seconds between completion polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("oTree error: {0}")]
    Host(#[from] HostError),

    #[error("Player {0} has no assignment")]
    MissingAssignment(u32),

    #[error("Player {player_id} is assigned model '{model}' which is not available in botex.env")]
    UnknownModel { player_id: u32, model: String },

    #[error("Session {0} thread panicked")]
    Panicked(usize),
}

/// What to run: the selected app with its configuration
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub app: String,
    pub roster: Roster,
    pub prompts: PromptBook,
    pub registry: ModelRegistry,
}

/// llama.cpp server settings
#[derive(Debug, Clone)]
pub struct LocalServer {
    pub url: String,
    pub server_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

/// How to run it
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub max_tokens: u32,
    pub temperature: f32,
    pub throttle: bool,
    pub open_browser: bool,
    pub poll_interval: Duration,
    pub local_server: LocalServer,
}

impl RunOptions {
    pub fn params(&self) -> CompletionParams {
        CompletionParams::new(self.temperature, self.max_tokens)
    }
}

/// Creates what each bot thread needs
pub trait BotFactory: Sync {
    fn llm(&self, spec: &ModelSpec) -> Result<Box<dyn LlmClient>, LlmError>;

    fn browser(&self) -> Box<dyn Browser>;
}

/// Provider clients keyed from the environment, plain HTTP browsing
pub struct LiveBots {
    pub local_url: String,
    pub throttle: bool,
}

impl BotFactory for LiveBots {
    fn llm(&self, spec: &ModelSpec) -> Result<Box<dyn LlmClient>, LlmError> {
        let api_key = spec
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        client_for(spec, api_key, &self.local_url, self.throttle)
    }

    fn browser(&self) -> Box<dyn Browser> {
        Box::new(HttpBrowser::new())
    }
}

/// A bot ready to start
#[derive(Debug, Clone)]
pub struct BotJob {
    pub player_id: u32,
    pub role: Option<String>,
    pub spec: ModelSpec,
    pub config: BotConfig,
}

/// How one bot ended
#[derive(Debug, Clone)]
pub struct BotReport {
    pub player_id: u32,
    pub participant_code: String,
    pub outcome: Result<BotOutcome, String>,
}

/// What a finished session produced
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub number: usize,
    pub local_id: String,
    /// oTree session code
    pub session_id: String,
    pub output_dir: PathBuf,
    pub bots: Vec<BotReport>,
    pub interrupted: bool,
    pub exported: Vec<PathBuf>,
}

/// Suffix shared by the output directory and every exported file
pub fn run_suffix(app: &str, humans: usize, bots: usize) -> String {
    format!("_{}_nhumans{}_nbots{}", app, humans, bots)
}

pub fn local_session_id(number: usize) -> String {
    format!("session_{}_{}", number, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Assignments passed to oTree as modified session config fields
pub fn session_config_fields(roster: &Roster) -> Map<String, Value> {
    let mut fields = Map::new();
    for a in roster.assignments() {
        let id = a.player_id;
        fields.insert(format!("player_{}_intended_model", id), Value::from(a.model_name.clone()));
        if let Some(role) = &a.role {
            fields.insert(format!("player_{}_role", id), Value::from(role.clone()));
        }
        if !a.is_human() {
            fields.insert(format!("bot_position_{}_model", id), Value::from(a.model_name.clone()));
            if let Some(role) = &a.role {
                fields.insert(format!("bot_position_{}_role", id), Value::from(role.clone()));
            }
        }
    }
    fields
}

/// One job per bot participant of the session
pub fn plan_bots(
    plan: &ExperimentPlan,
    handle: &SessionHandle,
    options: &RunOptions,
) -> Result<Vec<BotJob>, SessionError> {
    let mut jobs = Vec::new();

    for slot in handle.bot_slots() {
        let assignment = plan
            .roster
            .get(slot.player_id)
            .ok_or(SessionError::MissingAssignment(slot.player_id))?;
        let spec = plan
            .registry
            .get(&assignment.model_name)
            .ok_or_else(|| SessionError::UnknownModel {
                player_id: slot.player_id,
                model: assignment.model_name.clone(),
            })?
            .clone();

        let mut prompts = plan.prompts.resolve(assignment.role.as_deref());
        let mut params = options.params();
        if spec.is_local() {
            prompts = prompts.for_local_model();
            params = params.for_local_model();
        }

        let mut config = BotConfig::new(
            &handle.session_id,
            &slot.participant_code,
            &slot.url,
            &spec.full_name,
            prompts,
            params,
        );
        config.throttle = options.throttle;

        jobs.push(BotJob {
            player_id: slot.player_id,
            role: assignment.role.clone(),
            spec,
            config,
        });
    }

    Ok(jobs)
}

fn record_participants(
    db: &Database,
    app: &str,
    handle: &SessionHandle,
    base_url: &str,
) -> Result<(), SessionError> {
    db.with_connection(|conn| {
        for (code, human) in handle.participant_codes.iter().zip(&handle.is_human) {
            let url = crate::otree::participant_url(base_url, code);
            queries::insert_participant(conn, &ParticipantRecord::new(app, &handle.session_id, code, *human, &url))?;
        }
        Ok(())
    })?;
    Ok(())
}

fn log_assignments(number: usize, handle: &SessionHandle, roster: &Roster) {
    for (idx, code) in handle.participant_codes.iter().enumerate() {
        let player_id = idx as u32 + 1;
        let Some(a) = roster.get(player_id) else {
            continue;
        };
        if a.is_human() {
            info!(
                "Session {}: Player {} (participant {}) -> HUMAN (role: {})",
                number,
                player_id,
                code,
                a.role.as_deref().unwrap_or("none")
            );
        } else {
            info!(
                "Session {}: Player {} (participant {}) -> {} (role: {})",
                number,
                player_id,
                code,
                a.model_name,
                a.role_or_default()
            );
        }
    }
}

/// Start llama.cpp when a local bot needs it and none is running
fn local_server_for(jobs: &[BotJob], options: &RunOptions) -> Option<ManagedServer> {
    if !jobs.iter().any(|j| j.spec.is_local()) {
        return None;
    }

    let local = &options.local_server;
    let (Some(server_path), Some(model_path)) = (&local.server_path, &local.model_path) else {
        if !health_ok(&local.url) {
            warn!(
                "No llama.cpp server at {} and no server/model path given; local bots will fail",
                local.url
            );
        }
        return None;
    };

    let launch = LlamaCppOptions {
        server_path,
        model_path,
        server_url: &local.url,
        max_tokens: options.params().for_local_model().max_tokens,
        temperature: options.params().for_local_model().temperature,
    };
    match ensure_llamacpp(&launch) {
        Ok(server) => server,
        Err(e) => {
            error!("Could not start llama.cpp: {}", e);
            None
        }
    }
}

/// Run every bot on its own thread and wait for all of them
pub fn run_bots(
    jobs: &[BotJob],
    db: &Database,
    factory: &dyn BotFactory,
    interrupt: &InterruptFlag,
) -> Vec<BotReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|job| {
                info!(
                    "Starting bot for player {} with {} (role: {})",
                    job.player_id,
                    job.spec.name,
                    job.role.as_deref().unwrap_or("default")
                );
                let handle = scope.spawn(move || -> Result<BotOutcome, String> {
                    let llm = factory.llm(&job.spec).map_err(|e| e.to_string())?;
                    let browser = factory.browser();
                    run_bot(&job.config, llm.as_ref(), browser.as_ref(), db, interrupt)
                        .map_err(|e| e.to_string())
                });
                (job, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(job, handle)| {
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err("bot thread panicked".to_string()));
                if let Err(e) = &outcome {
                    error!("Bot for player {} failed: {}", job.player_id, e);
                }
                BotReport {
                    player_id: job.player_id,
                    participant_code: job.config.participant_code.clone(),
                    outcome,
                }
            })
            .collect()
    })
}

/// Write every export of a finished session
fn export_session(
    plan: &ExperimentPlan,
    host: &dyn ExperimentHost,
    db: &Database,
    files: &SessionFiles,
    bots_ran: bool,
) -> Vec<PathBuf> {
    let mut exported = Vec::new();

    let wide = files.wide_csv();
    match host.export_wide(&wide) {
        Ok(()) => {
            info!("oTree wide data exported to {}", wide.display());
            exported.push(wide.clone());
        }
        Err(e) => error!("Failed to export oTree wide data: {}", e),
    }

    if wide.exists() {
        match normalize_file(files) {
            Ok(_) => exported.extend(Table::all().iter().map(|t| files.table_csv(*t))),
            Err(e) => warn!("Data normalization failed: {}", e),
        }
    }

    let mut tally = ChoiceTally::new();
    if bots_ran {
        let path = files.bot_participants_csv();
        match export_participants(db, files.session_id(), &path) {
            Ok(n) => {
                info!("Exported {} participants to {}", n, path.display());
                exported.push(path);
            }
            Err(e) => warn!("Could not export participant data: {}", e),
        }

        let path = files.bot_responses_csv();
        match export_responses(db, files.session_id(), &path) {
            Ok(export) => {
                info!("Bot responses exported ({} export)", export.mode);
                tally = tally_choices(&export.rows);
                exported.push(path);
            }
            Err(e) => warn!("Error exporting bot responses: {}", e),
        }
    }

    let summary = ExportSummary::from_roster(&plan.app, files.session_id(), &plan.roster, tally);
    match summary.write(files) {
        Ok(path) => exported.push(path),
        Err(e) => warn!("Could not write export summary: {}", e),
    }

    exported
}

fn open_database(dir: &Path, local_id: &str, suffix: &str) -> Result<Database, SessionError> {
    let db = Database::new(dir.join(db_file_name(local_id, suffix)))?;
    db.initialize()?;
    Ok(db)
}

/// Run one session from creation to export
pub fn run_session(
    plan: &ExperimentPlan,
    options: &RunOptions,
    number: usize,
    host: &dyn ExperimentHost,
    factory: &dyn BotFactory,
    interrupt: &InterruptFlag,
) -> Result<SessionReport, SessionError> {
    let roster = &plan.roster;
    let humans = roster.human_count();
    let bots = roster.bot_count();

    let local_id = local_session_id(number);
    let suffix = run_suffix(&plan.app, humans, bots);
    let output_dir = options.output_dir.join(format!("session_{}{}", local_id, suffix));
    fs::create_dir_all(&output_dir)?;
    let db = open_database(&output_dir, &local_id, &suffix)?;
    info!("Session {}: output directory {}", number, output_dir.display());

    info!(
        "Session {}: available roles for app '{}': {:?}",
        number,
        plan.app,
        plan.prompts.available_roles()
    );
    let unknown = plan.prompts.unknown_roles(roster);
    if !unknown.is_empty() {
        warn!("Session {}: invalid roles found: {:?}", number, unknown);
        warn!("Session {}: these players will use default prompts", number);
    }

    let fields = session_config_fields(roster);
    let handle = init_session(host, &plan.app, &roster.is_human_flags(), &fields)?;
    record_participants(&db, &plan.app, &handle, host.base_url())?;
    log_assignments(number, &handle, roster);

    let monitor = monitor_url(host.base_url(), &handle.session_id);
    info!("Session {}: monitor URL {}", number, monitor);
    report::print_session_start(number, &plan.app, &handle, roster, &monitor);
    if options.open_browser {
        browser::open_browser(&monitor, browser::BROWSER_ATTEMPTS);
    }

    let jobs = plan_bots(plan, &handle, options)?;
    let mut bot_reports = Vec::new();
    if !jobs.is_empty() {
        let server = local_server_for(&jobs, options);
        bot_reports = run_bots(&jobs, &db, factory, interrupt);
        if let Some(server) = server {
            info!("Session {}: stopping {}", number, server.name());
            server.stop();
        }
        info!("Session {}: bots completed", number);
    }

    let mut interrupted = interrupt.is_raised();
    if humans > 0 && !interrupted {
        report::print_waiting(humans, &monitor);
        let outcome = wait_for_completion(
            host,
            &handle.session_id,
            &handle.is_human,
            options.poll_interval,
            interrupt,
        );
        interrupted = outcome == WaitOutcome::Interrupted;
    } else if humans == 0 {
        info!("Session {}: all bot participants have completed", number);
    }

    info!("Session {}: exporting data", number);
    let files = SessionFiles::new(&output_dir, &handle.session_id, &suffix);
    let exported = export_session(plan, host, &db, &files, !jobs.is_empty());
    info!("Session {}: data export completed", number);

    Ok(SessionReport {
        number,
        local_id,
        session_id: handle.session_id,
        output_dir,
        bots: bot_reports,
        interrupted,
        exported,
    })
}

/// Run `count` sessions in parallel, numbered from 1
pub fn run_sessions(
    plan: &ExperimentPlan,
    options: &RunOptions,
    count: usize,
    host: &dyn ExperimentHost,
    factory: &dyn BotFactory,
    interrupt: &InterruptFlag,
) -> Vec<Result<SessionReport, SessionError>> {
    thread::scope(|scope| {
        let handles: Vec<_> = (1..=count)
            .map(|number| {
                let handle = scope.spawn(move || run_session(plan, options, number, host, factory, interrupt));
                (number, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(number, handle)| {
                let result = handle
                    .join()
                    .unwrap_or(Err(SessionError::Panicked(number)));
                if let Err(e) = &result {
                    error!("Session {}: {}", number, e);
                }
                result
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::page::fixtures::FINISHED_PAGE;
    use crate::bot::{BotError, Fetched};
    use crate::llm::testing::ScriptedClient;
    use crate::otree::testing::FakeHost;

    struct FinishedBrowser;

    impl Browser for FinishedBrowser {
        fn get(&self, url: &str) -> Result<Fetched, BotError> {
            Ok((url.to_string(), FINISHED_PAGE.to_string()))
        }

        fn submit(&self, action: &str, _fields: &[(String, String)]) -> Result<Fetched, BotError> {
            Ok((action.to_string(), FINISHED_PAGE.to_string()))
        }
    }

    struct TestBots;

    impl BotFactory for TestBots {
        fn llm(&self, _spec: &ModelSpec) -> Result<Box<dyn LlmClient>, LlmError> {
            Ok(Box::new(ScriptedClient::new(Vec::new())))
        }

        fn browser(&self) -> Box<dyn Browser> {
            Box::new(FinishedBrowser)
        }
    }

    const WIDE: &str = "\
participant.id_in_session,participant.code,session.code,rps_repeat.1.player.choice,rps_repeat.1.group.id_in_subsession
1,p1,sess01,R,1
2,p2,sess01,P,1
";

    fn plan(csv: &str) -> ExperimentPlan {
        ExperimentPlan {
            app: "rps_repeat".to_string(),
            roster: Roster::from_reader(csv.as_bytes()).unwrap(),
            prompts: PromptBook::from_json(r#"{"roles": {"P5": {"system": "s", "analyze_page_q": "{body}"}}}"#)
                .unwrap(),
            registry: ModelRegistry::from_lookup(|_| None),
        }
    }

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            output_dir: dir.to_path_buf(),
            max_tokens: 1024,
            temperature: 0.7,
            throttle: false,
            open_browser: false,
            poll_interval: Duration::ZERO,
            local_server: LocalServer {
                url: "http://localhost:8080".to_string(),
                server_path: None,
                model_path: None,
            },
        }
    }

    fn handle(is_human: &[bool]) -> SessionHandle {
        let codes: Vec<String> = (1..=is_human.len()).map(|i| format!("p{}", i)).collect();
        let url = |c: &String| format!("http://otree.test/InitializeParticipant/{}", c);
        SessionHandle {
            session_id: "sess01".to_string(),
            human_urls: codes.iter().zip(is_human).filter(|(_, h)| **h).map(|(c, _)| url(c)).collect(),
            bot_urls: codes.iter().zip(is_human).filter(|(_, h)| !**h).map(|(c, _)| url(c)).collect(),
            participant_codes: codes,
            is_human: is_human.to_vec(),
        }
    }

    #[test]
    fn test_all_human_session_plans_no_bots() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan("player_id,model_name\n1,human\n2,human\n");

        let jobs = plan_bots(&plan, &handle(&[true, true]), &options(dir.path())).unwrap();

        assert!(jobs.is_empty());
    }

    #[test]
    fn test_plan_bots_resolves_models_and_roles() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan("player_id,model_name,role\n1,human,\n2,gemini-1.5-flash,P5\n3,gemini-1.5-flash,P9\n");

        let jobs = plan_bots(&plan, &handle(&[true, false, false]), &options(dir.path())).unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].player_id, 2);
        assert_eq!(jobs[0].config.participant_code, "p2");
        assert_eq!(jobs[0].config.model, "gemini/gemini-1.5-flash");
        assert_eq!(jobs[0].config.prompts.system, "s");
        assert!(!jobs[0].config.throttle);
        // unknown role falls back to the built-in prompts
        assert_eq!(jobs[1].config.prompts, crate::apps::PromptSet::builtin());
    }

    #[test]
    fn test_session_config_fields() {
        let roster = Roster::from_reader("player_id,model_name,role\n1,human,P1\n2,gemini-1.5-flash,P2\n".as_bytes())
            .unwrap();

        let fields = session_config_fields(&roster);

        assert_eq!(fields["player_1_intended_model"], "human");
        assert_eq!(fields["player_1_role"], "P1");
        assert!(!fields.contains_key("bot_position_1_model"));
        assert_eq!(fields["bot_position_2_model"], "gemini-1.5-flash");
        assert_eq!(fields["bot_position_2_role"], "P2");
    }

    #[test]
    fn test_run_suffix() {
        assert_eq!(run_suffix("rps_oneshot", 1, 2), "_rps_oneshot_nhumans1_nbots2");
    }

    #[test]
    fn test_run_session_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan("player_id,model_name,role\n1,human,\n2,gemini-1.5-flash,P5\n");
        let host = FakeHost::new(2)
            .with_snapshots(vec![vec![true, true]])
            .with_wide_csv(WIDE);

        let report = run_session(&plan, &options(dir.path()), 1, &host, &TestBots, &InterruptFlag::new()).unwrap();

        assert_eq!(report.session_id, "sess01");
        assert!(!report.interrupted);
        assert_eq!(report.bots.len(), 1);
        assert!(report.bots[0].outcome.is_ok());
        assert!(report
            .output_dir
            .to_string_lossy()
            .ends_with("_rps_repeat_nhumans1_nbots1"));

        let created = host.created.lock().unwrap();
        assert_eq!(created[0].0, "rps_repeat");
        assert_eq!(created[0].1, 2);
        assert_eq!(created[0].2["bot_position_2_role"], "P5");

        let files = SessionFiles::new(&report.output_dir, "sess01", "_rps_repeat_nhumans1_nbots1");
        assert!(files.wide_csv().exists());
        assert!(files.table_csv(Table::Player).exists());
        assert!(files.bot_participants_csv().exists());
        assert!(files.bot_responses_csv().exists());
        assert!(files.summary_txt().exists());
        assert_eq!(report.exported.len(), 8);
    }

    #[test]
    fn test_failed_wide_export_still_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan("player_id,model_name\n1,gemini-1.5-flash\n");
        let host = FakeHost::new(1);

        let report = run_session(&plan, &options(dir.path()), 1, &host, &TestBots, &InterruptFlag::new()).unwrap();

        let files = SessionFiles::new(&report.output_dir, "sess01", "_rps_repeat_nhumans0_nbots1");
        assert!(!files.wide_csv().exists());
        assert!(files.summary_txt().exists());
        let summary = fs::read_to_string(files.summary_txt()).unwrap();
        assert!(summary.contains("botex_sess01_responses_rps_repeat_nhumans0_nbots1.csv"));
    }

    #[test]
    fn test_run_sessions_runs_each_session() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan("player_id,model_name\n1,gemini-1.5-flash\n");
        let host = FakeHost::new(1);

        let results = run_sessions(&plan, &options(dir.path()), 2, &host, &TestBots, &InterruptFlag::new());

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(host.created.lock().unwrap().len(), 2);
    }
}
