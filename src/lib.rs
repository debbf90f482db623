//! LLM Experiments
//!
//! Runs oTree Rock-Paper-Scissors experiments where some or all participants
//! are LLM bots. It handles:
//! - App discovery and per-player model/role assignments
//! - Session creation through the oTree REST API
//! - One bot thread per LLM participant, logging conversations to SQLite
//! - Waiting for human participants
//! - CSV export, normalization and a text summary per session

pub mod apps;
pub mod bot;
pub mod cli;
pub mod config;
pub mod db;
pub mod export;
pub mod game;
pub mod interrupt;
pub mod llm;
pub mod models;
pub mod otree;
pub mod parser;
pub mod report;
pub mod session;
pub mod validation;

use std::fs;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apps::{discover_apps, select_app, AppError, PromptError, RosterError};
use cli::{Args, Mode};
use config::{ConfigError, HostSettings, ModelRegistry};
use interrupt::InterruptFlag;
use otree::process::{is_reachable, start_otree, ManagedServer};
use otree::{HostError, OtreeClient};
use report::ConfigSummary;
use session::{ExperimentPlan, LiveBots, LocalServer, RunOptions};

/// Errors that end the process
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error("Could not load participant assignments for app '{app}': {source}")]
    Roster {
        app: String,
        #[source]
        source: RosterError,
    },

    #[error("Could not load prompts: {0}")]
    Prompts(#[from] PromptError),

    #[error("oTree error: {0}")]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{passed}/{total} validation checks passed")]
    ValidationFailed { passed: usize, total: usize },

    #[error("All {0} sessions failed")]
    SessionsFailed(usize),
}

/// Set up `tracing` output; `RUST_LOG` overrides the default filter
pub fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default = format!(
        "{},reqwest=warn,hyper=warn,hyper_util=warn,html5ever=warn,selectors=warn,rustls=warn",
        level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .try_init();
}

/// Run the command described by `args`
pub fn run(args: &Args) -> Result<(), RunError> {
    let mode = args.mode();
    if mode == Mode::ListApps {
        let apps = discover_apps(&args.apps_dir)?;
        print!("{}", report::app_list(&apps));
        return Ok(());
    }

    let app = select_app(&args.apps_dir, args.app.as_deref()).map_err(|e| {
        eprintln!("{}", report::app_error(&e));
        RunError::from(e)
    })?;
    let registry = ModelRegistry::from_env();
    info!("{} models available", registry.len());

    if mode == Mode::ValidateOnly {
        let checks = validation::validate(&app, &args.output_dir, &registry, |k| std::env::var(k).ok());
        print!("{}", report::validation(&checks));
        return if checks.all_passed() {
            Ok(())
        } else {
            Err(RunError::ValidationFailed {
                passed: checks.passed(),
                total: checks.total(),
            })
        };
    }

    let roster_error = |source: RosterError| {
        eprintln!("{}", report::roster_help(&app.name));
        RunError::Roster {
            app: app.name.clone(),
            source,
        }
    };
    let roster = app.load_roster().map_err(roster_error)?;
    roster.validate_models(&registry).map_err(roster_error)?;
    let prompts = app.load_prompts()?;

    if args.sessions == 0 {
        return Err(ConfigError::Invalid {
            name: "--sessions".to_string(),
            reason: "must be at least 1".to_string(),
        }
        .into());
    }

    let summary = ConfigSummary {
        app: &app.name,
        sessions: args.sessions,
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        output_dir: &args.output_dir,
    };
    print!("{}", report::config_summary(&summary, &roster));

    if mode == Mode::DryRun {
        print!("{}", report::dry_run(&summary, &roster, &registry, &args.otree_url));
        return Ok(());
    }
    print!("{}", report::assignments(&roster, &registry));

    fs::create_dir_all(&args.output_dir)?;
    let interrupt = InterruptFlag::new();
    interrupt.install_ctrlc_handler();

    let server = otree_server(args)?;
    let host = OtreeClient::new(&args.otree_url, HostSettings::from_env(args.otree_rest_key.as_deref()));
    let factory = LiveBots {
        local_url: args.llamacpp_url.clone(),
        throttle: !args.no_throttle,
    };
    let options = RunOptions {
        output_dir: args.output_dir.clone(),
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        throttle: !args.no_throttle,
        open_browser: !args.no_browser,
        poll_interval: args.poll_interval(),
        local_server: LocalServer {
            url: args.llamacpp_url.clone(),
            server_path: args.llamacpp_server.clone(),
            model_path: args.local_llm_path.clone(),
        },
    };
    let plan = ExperimentPlan {
        app: app.name.clone(),
        roster,
        prompts,
        registry,
    };

    let results = session::run_sessions(&plan, &options, args.sessions, &host, &factory, &interrupt);
    print!("{}", report::results(&results));

    if let Some(server) = server {
        info!("Stopping {}", server.name());
        server.stop();
    }

    if results.iter().all(|r| r.is_err()) {
        return Err(RunError::SessionsFailed(results.len()));
    }
    Ok(())
}

/// Start oTree unless one is already answering or `--external-server` is set
fn otree_server(args: &Args) -> Result<Option<ManagedServer>, RunError> {
    if args.external_server {
        if !is_reachable(&args.otree_url) {
            warn!("No oTree server answering at {}", args.otree_url);
        }
        return Ok(None);
    }
    if is_reachable(&args.otree_url) {
        info!("Using oTree server already running at {}", args.otree_url);
        return Ok(None);
    }

    info!("Starting oTree server in {}", args.otree_project.display());
    Ok(Some(start_otree(&args.otree_project, &args.otree_url)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn make_app(root: &std::path::Path, roster: &str) {
        let dir = root.join("rps_oneshot");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(apps::MODELS_FILE), roster).unwrap();
    }

    fn args(root: &std::path::Path, extra: &[&str]) -> Args {
        let apps_dir = root.to_string_lossy().to_string();
        let output = root.join("out").to_string_lossy().to_string();
        let mut argv = vec!["llm-experiments", "--apps-dir", &apps_dir, "-o", &output];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_list_apps_succeeds_without_apps() {
        let root = tempfile::tempdir().unwrap();
        assert!(run(&args(root.path(), &["--list-apps"])).is_ok());
    }

    #[test]
    fn test_unknown_app_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        make_app(root.path(), "player_id,model_name\n1,human\n");

        let result = run(&args(root.path(), &["-a", "nope", "--dry-run"]));
        assert!(matches!(result, Err(RunError::App(AppError::NotFound { .. }))));
    }

    #[test]
    fn test_dry_run_starts_nothing() {
        let root = tempfile::tempdir().unwrap();
        make_app(root.path(), "player_id,model_name,role\n1,human,P1\n2,human,\n");

        assert!(run(&args(root.path(), &["-a", "rps_oneshot", "--dry-run"])).is_ok());
        assert!(!root.path().join("out").exists());
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        make_app(root.path(), "player_id,model_name\n1,no-such-model\n");

        let result = run(&args(root.path(), &["-a", "rps_oneshot", "--dry-run"]));
        assert!(matches!(
            result,
            Err(RunError::Roster {
                source: RosterError::UnknownModel { player_id: 1, .. },
                ..
            })
        ));
    }
}
