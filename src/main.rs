use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};

use llm_experiments_lib::cli::Args;
use llm_experiments_lib::config::load_env_file;
use llm_experiments_lib::{init_logging, report, run};

fn main() -> ExitCode {
    println!("{}", report::BANNER);

    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = load_env_file(&args.env_file) {
        warn!("{}", e);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
