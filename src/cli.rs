//! Command line arguments

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// What the invocation asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ListApps,
    ValidateOnly,
    DryRun,
    Run,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "llm-experiments")]
#[command(about = "Run oTree experiments with LLM bot participants and per-player roles")]
#[command(version)]
pub struct Args {
    /// oTree app to run (a directory under --apps-dir)
    #[arg(short = 'a', long)]
    pub app: Option<String>,

    /// List available apps and exit
    #[arg(long)]
    pub list_apps: bool,

    /// Number of sessions to run in parallel
    #[arg(short = 's', long, default_value_t = 1)]
    pub sessions: usize,

    /// Directory for session output
    #[arg(short = 'o', long, default_value = "botex_data")]
    pub output_dir: PathBuf,

    /// Maximum tokens per LLM reply
    #[arg(long, visible_alias = "mt", default_value_t = 1024)]
    pub max_tokens: u32,

    /// Sampling temperature
    #[arg(short = 't', long, default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value = "http://localhost:8000")]
    pub otree_url: String,

    /// oTree REST key (falls back to OTREE_REST_KEY)
    #[arg(long)]
    pub otree_rest_key: Option<String>,

    /// Disable retry throttling of LLM calls
    #[arg(short = 'x', long)]
    pub no_throttle: bool,

    /// Check the configuration and exit
    #[arg(long)]
    pub validate_only: bool,

    /// Show what would run without starting anything
    #[arg(long)]
    pub dry_run: bool,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Do not open the session monitor in a browser
    #[arg(long)]
    pub no_browser: bool,

    /// Directory holding the oTree apps
    #[arg(long, default_value = "experiments")]
    pub apps_dir: PathBuf,

    #[arg(long, default_value = "botex.env")]
    pub env_file: PathBuf,

    /// oTree project directory used to start `otree devserver`
    #[arg(long, default_value = ".")]
    pub otree_project: PathBuf,

    /// Use an oTree server that is already running
    #[arg(long)]
    pub external_server: bool,

    /// Seconds between completion checks while humans play
    #[arg(long, default_value_t = 20)]
    pub poll_interval: u64,

    #[arg(long, default_value = "http://localhost:8080")]
    pub llamacpp_url: String,

    /// llama.cpp server binary, started when a local model is assigned
    #[arg(long)]
    pub llamacpp_server: Option<PathBuf>,

    /// GGUF model file for the llama.cpp server
    #[arg(long)]
    pub local_llm_path: Option<PathBuf>,
}

impl Args {
    /// Diagnostic flags take precedence over running
    pub fn mode(&self) -> Mode {
        if self.list_apps {
            Mode::ListApps
        } else if self.validate_only {
            Mode::ValidateOnly
        } else if self.dry_run {
            Mode::DryRun
        } else {
            Mode::Run
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}
