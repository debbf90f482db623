//! Console output
//!
//! Everything the user reads on stdout is formatted here. Logs go through
//! `tracing` instead.

use std::fmt::Write as _;
use std::path::Path;

use crate::apps::{AppDir, AppError, AppListing, Roster};
use crate::config::ModelRegistry;
use crate::otree::SessionHandle;
use crate::session::{SessionError, SessionReport};
use crate::validation::ValidationReport;

const BOX_WIDTH: usize = 78;
const RULE_WIDTH: usize = 60;

pub const BANNER: &str = "
╔══════════════════════════════════════════════════════════════════════════════╗
║                           MULTI-APP EXPERIMENTS                              ║
║                     with Per-Player Roles (LLM bots)                         ║
╚══════════════════════════════════════════════════════════════════════════════╝
";

fn box_line(out: &mut String, label: &str, value: impl std::fmt::Display) {
    let text = format!(" {:<20}{}", label, value);
    let _ = writeln!(out, "║{:<width$}║", text, width = BOX_WIDTH);
}

/// Roles with the players assigned to them
fn players_by_role(roster: &Roster) -> Vec<(String, Vec<u32>)> {
    let mut by_role: Vec<(String, Vec<u32>)> = Vec::new();
    for (player_id, role) in roster.roles() {
        match by_role.iter_mut().find(|(r, _)| *r == role) {
            Some((_, players)) => players.push(player_id),
            None => by_role.push((role, vec![player_id])),
        }
    }
    by_role.sort_by(|a, b| a.0.cmp(&b.0));
    by_role
}

/// Settings shown in the configuration box
#[derive(Debug, Clone)]
pub struct ConfigSummary<'a> {
    pub app: &'a str,
    pub sessions: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub output_dir: &'a Path,
}

pub fn config_summary(summary: &ConfigSummary<'_>, roster: &Roster) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "╔{}╗", "═".repeat(BOX_WIDTH));
    let _ = writeln!(out, "║{:^width$}║", "EXPERIMENT CONFIGURATION", width = BOX_WIDTH);
    let _ = writeln!(out, "╠{}╣", "═".repeat(BOX_WIDTH));
    box_line(&mut out, "App:", summary.app);
    box_line(&mut out, "Total participants:", roster.len());
    box_line(&mut out, "Human participants:", roster.human_count());
    box_line(&mut out, "Bot participants:", roster.bot_count());
    box_line(&mut out, "Sessions to run:", summary.sessions);
    box_line(&mut out, "Max tokens:", summary.max_tokens);
    box_line(&mut out, "Temperature:", summary.temperature);
    box_line(&mut out, "Output directory:", summary.output_dir.display());
    let _ = writeln!(out, "╚{}╝\n", "═".repeat(BOX_WIDTH));

    let models = roster.unique_models();
    if models.is_empty() {
        let _ = writeln!(out, "Models in use: None (humans only)");
    } else {
        let _ = writeln!(out, "Models in use:");
        for model in models {
            let _ = writeln!(out, "  • {}", model);
        }
    }

    let roles = players_by_role(roster);
    if roles.is_empty() {
        let _ = writeln!(out, "\nRoles assigned: None (default prompts only)");
    } else {
        let _ = writeln!(out, "\nRoles assigned:");
        for (role, players) in roles {
            let ids: Vec<String> = players.iter().map(u32::to_string).collect();
            let _ = writeln!(out, "  • {}: players {}", role, ids.join(", "));
        }
    }
    out
}

/// One line per player with model, provider and role
pub fn assignments(roster: &Roster, registry: &ModelRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Participant Assignments:");
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));

    for a in roster.assignments() {
        let role = a.role_or_default();
        if a.is_human() {
            let _ = writeln!(out, "  Player {}: HUMAN (role: {})", a.player_id, role);
        } else {
            match registry.get(&a.model_name) {
                Some(spec) => {
                    let _ = writeln!(
                        out,
                        "  Player {}: {} ({}, role: {})",
                        a.player_id, a.model_name, spec.provider, role
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "  Player {}: {} (UNKNOWN PROVIDER, role: {})",
                        a.player_id, a.model_name, role
                    );
                }
            }
        }
    }
    out
}

/// What `--dry-run` would have started
pub fn dry_run(
    summary: &ConfigSummary<'_>,
    roster: &Roster,
    registry: &ModelRegistry,
    otree_url: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "DRY RUN MODE");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    out.push_str(&assignments(roster, registry));

    let _ = writeln!(out, "\nExperiment would run with:");
    let _ = writeln!(out, "  • App: {}", summary.app);
    let _ = writeln!(out, "  • {} session(s)", summary.sessions);
    let _ = writeln!(out, "  • {} participants per session", roster.len());
    let _ = writeln!(out, "  • Output directory: {}", summary.output_dir.display());
    let _ = writeln!(out, "  • oTree URL: {}", otree_url);

    let roles: Vec<String> = players_by_role(roster).into_iter().map(|(r, _)| r).collect();
    if !roles.is_empty() {
        let _ = writeln!(out, "  • Per-player roles: {}", roles.join(", "));
    }

    let _ = writeln!(out, "\nTo execute this configuration, run without --dry-run");
    out
}

/// `--list-apps` output
pub fn app_list(apps: &[AppDir]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nAvailable oTree Apps:");
    let _ = writeln!(out, "{}", "=".repeat(40));

    if apps.is_empty() {
        let _ = writeln!(out, "  No apps found.");
        let _ = writeln!(out, "\n  To create an app, ensure it has:");
        let _ = writeln!(out, "  - __init__.py (oTree app definition)");
        let _ = writeln!(out, "  - player_models.csv (participant assignments)");
        let _ = writeln!(out, "  - prompts.json (prompting strategies)");
        return out;
    }

    for app in apps {
        match app.listing() {
            AppListing::Ready {
                participants,
                has_roles,
            } => {
                let roles = if has_roles { " (with roles)" } else { "" };
                let _ = writeln!(out, "  {:<15} ({} participants{})", app.name, participants, roles);
            }
            AppListing::ConfigError => {
                let _ = writeln!(out, "  {:<15} (configuration error)", app.name);
            }
        }
    }
    out
}

/// Message for an app that could not be selected
pub fn app_error(error: &AppError) -> String {
    match error {
        AppError::NotSelected { available } if available.is_empty() => {
            "ERROR: No apps found. Use --list-apps to see requirements.".to_string()
        }
        AppError::NotSelected { available } => format!(
            "ERROR: Must specify an app. Available apps: {}\nUse --list-apps for more details.",
            available.join(", ")
        ),
        AppError::NotFound { name, available } if available.is_empty() => format!(
            "ERROR: App '{}' not found.\nNo apps found. Use --list-apps for requirements.",
            name
        ),
        AppError::NotFound { name, available } => format!(
            "ERROR: App '{}' not found.\nAvailable apps: {}",
            name,
            available.join(", ")
        ),
        AppError::Pattern(e) => format!("ERROR: {}", e),
    }
}

/// Help shown when `player_models.csv` cannot be loaded
pub fn roster_help(app: &str) -> String {
    format!(
        "
ERROR: Could not load participant assignments for app '{app}'.

Please ensure the app has a valid player_models.csv file with format:
player_id,model_name,role
1,human,thinker
2,gemini-1.5-flash,non_thinker
3,claude-3-haiku,

Note: The 'role' column is optional. If provided, it assigns per-player roles.

Use --list-apps to see available apps.
"
    )
}

/// `--validate-only` output
pub fn validation(report: &ValidationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "                 VALIDATION MODE");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));

    for (idx, check) in report.checks.iter().enumerate() {
        let _ = writeln!(out, "{}. {}...", idx + 1, check.name);
        let mark = if check.passed { "✓" } else { "✗" };
        for message in &check.messages {
            let _ = writeln!(out, "   {} {}", mark, message);
        }
    }

    let _ = writeln!(
        out,
        "\nValidation Summary: {}/{} checks passed",
        report.passed(),
        report.total()
    );
    if report.all_passed() {
        let _ = writeln!(out, "✓ All validation checks passed! Ready to run experiments.");
    } else {
        let _ = writeln!(out, "✗ Some validation checks failed. Please fix the issues above.");
    }
    out
}

/// URLs and bots of a freshly created session
pub fn session_start(number: usize, app: &str, handle: &SessionHandle, roster: &Roster, monitor: &str) -> String {
    let mut out = String::new();

    let humans = handle.human_slots();
    if !humans.is_empty() {
        let _ = writeln!(out, "\nSession {}: Human participant URLs:", number);
        for (player_id, url) in humans {
            let role = roster
                .get(player_id)
                .and_then(|a| a.role.as_deref())
                .map(|r| format!(" (role: {})", r))
                .unwrap_or_default();
            let _ = writeln!(out, "  Player {}: {}{}", player_id, url, role);
        }
    }

    let bots = handle.bot_slots();
    if bots.is_empty() {
        let _ = writeln!(
            out,
            "\nSession {}: All {} participants are human",
            number,
            handle.participant_codes.len()
        );
    } else {
        let with_roles = if roster.has_roles() { " with per-player roles" } else { "" };
        let _ = writeln!(
            out,
            "\nSession {}: Starting {} bots for app '{}'{}",
            number,
            bots.len(),
            app,
            with_roles
        );
        if roster.has_roles() {
            for (idx, slot) in bots.iter().enumerate() {
                if let Some(a) = roster.get(slot.player_id) {
                    let _ = writeln!(
                        out,
                        "    Bot {} (Player {}): {} with role '{}'",
                        idx + 1,
                        slot.player_id,
                        a.model_name,
                        a.role_or_default()
                    );
                }
            }
        }
    }

    let _ = writeln!(out, "Monitor progress at: {}", monitor);
    out
}

pub fn print_session_start(number: usize, app: &str, handle: &SessionHandle, roster: &Roster, monitor: &str) {
    print!("{}", session_start(number, app, handle, roster, monitor));
}

pub fn print_waiting(humans: usize, monitor: &str) {
    println!("\nWaiting for {} human participants to complete the experiment...", humans);
    println!("You can monitor progress at: {}", monitor);
    println!("Press Ctrl+C to stop early and export current data.\n");
}

/// Final report over all sessions
pub fn results(results: &[Result<SessionReport, SessionError>]) -> String {
    let mut out = String::new();
    let successes = results.iter().filter(|r| r.is_ok()).count();

    if let [single] = results {
        match single {
            Ok(report) => {
                let _ = writeln!(out, "\n✓ Session completed successfully!");
                let _ = writeln!(out, "  Session ID: {}", report.session_id);
                let _ = writeln!(out, "  Output directory: {}", report.output_dir.display());
                if report.interrupted {
                    let _ = writeln!(out, "  (stopped early, partial data exported)");
                }
            }
            Err(e) => {
                let _ = writeln!(out, "\n✗ Session failed: {}", e);
            }
        }
        return out;
    }

    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(
        out,
        "EXPERIMENT COMPLETED: {}/{} sessions successful",
        successes,
        results.len()
    );
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));

    if successes > 0 {
        let _ = writeln!(out, "✓ Successful sessions:");
        for (idx, result) in results.iter().enumerate() {
            if let Ok(report) = result {
                let _ = writeln!(out, "  Session {}: {}", idx + 1, report.session_id);
                let _ = writeln!(out, "    Output: {}", report.output_dir.display());
            }
        }
    }
    if successes < results.len() {
        let _ = writeln!(out, "✗ Failed sessions:");
        for (idx, result) in results.iter().enumerate() {
            if let Err(e) = result {
                let _ = writeln!(out, "  Session {}: {}", idx + 1, e);
            }
        }
    }
    out
}
