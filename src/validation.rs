//! `--validate-only` checks
//!
//! Six checks run against the selected app without starting anything:
//! app files, roster, roles, models, API keys and the output directory.

use std::fs;
use std::path::Path;

use crate::apps::{AppDir, PromptBook, Roster};
use crate::config::ModelRegistry;

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub messages: Vec<String>,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            messages: vec![message.into()],
        }
    }

    fn fail(name: &'static str, messages: Vec<String>) -> Self {
        Self {
            name,
            passed: false,
            messages,
        }
    }
}

/// All check results, in order
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total(&self) -> usize {
        self.checks.len()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }
}

fn check_app_files(app: &AppDir) -> CheckResult {
    const NAME: &str = "App configuration validation";
    let missing = app.missing_files();
    if missing.is_empty() {
        CheckResult::pass(NAME, "App configuration is complete")
    } else {
        CheckResult::fail(
            NAME,
            vec![format!("Missing files in app '{}': {}", app.name, missing.join(", "))],
        )
    }
}

fn check_roles(app: &AppDir, roster: &Roster, prompts: &PromptBook) -> CheckResult {
    const NAME: &str = "Role assignment validation";
    if !roster.has_roles() {
        return CheckResult::pass(NAME, "No specific roles assigned - will use default prompts");
    }
    if prompts.roles.is_empty() {
        return CheckResult::pass(
            NAME,
            format!("Could not determine valid roles for app '{}', but roles are assigned", app.name),
        );
    }

    let unknown = prompts.unknown_roles(roster);
    if unknown.is_empty() {
        CheckResult::pass(NAME, format!("All assigned roles are valid for app '{}'", app.name))
    } else {
        let roles: Vec<String> = unknown.into_iter().map(|(_, role)| role).collect();
        CheckResult::fail(
            NAME,
            vec![
                format!("Invalid roles found: {}", roles.join(", ")),
                format!("Valid roles for {}: {}", app.name, prompts.available_roles().join(", ")),
            ],
        )
    }
}

fn check_api_keys<F>(roster: &Roster, registry: &ModelRegistry, lookup: &F) -> CheckResult
where
    F: Fn(&str) -> Option<String>,
{
    const NAME: &str = "Environment configuration check";
    let mut issues: Vec<String> = roster
        .unique_models()
        .into_iter()
        .filter_map(|model| registry.get(model)?.api_key_env.clone())
        .filter(|key| lookup(key.as_str()).map_or(true, |v| v.trim().is_empty()))
        .map(|key| format!("Missing API key: {}", key))
        .collect();
    issues.sort();
    issues.dedup();

    if issues.is_empty() {
        CheckResult::pass(NAME, "Environment configuration is valid")
    } else {
        CheckResult::fail(NAME, issues)
    }
}

fn check_output_dir(output_dir: &Path) -> CheckResult {
    const NAME: &str = "Output directory check";
    let probe = output_dir.join(".test_write");
    let result = fs::create_dir_all(output_dir)
        .and_then(|_| fs::write(&probe, "test"))
        .and_then(|_| fs::remove_file(&probe));

    match result {
        Ok(()) => CheckResult::pass(NAME, "Output directory is writable"),
        Err(e) => CheckResult::fail(NAME, vec![format!("Output directory issue: {}", e)]),
    }
}

/// Run every check; `lookup` reads environment variables
pub fn validate<F>(app: &AppDir, output_dir: &Path, registry: &ModelRegistry, lookup: F) -> ValidationReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = ValidationReport::default();
    report.checks.push(check_app_files(app));

    let roster = app.load_roster();
    match &roster {
        Ok(_) => report
            .checks
            .push(CheckResult::pass("Model mapping validation", "Model mapping loaded successfully")),
        Err(e) => report.checks.push(CheckResult::fail(
            "Model mapping validation",
            vec![format!("Model mapping validation failed: {}", e)],
        )),
    }

    match &roster {
        Ok(roster) => {
            report.checks.push(match app.load_prompts() {
                Ok(prompts) => check_roles(app, roster, &prompts),
                Err(e) => CheckResult::fail(
                    "Role assignment validation",
                    vec![format!("Could not read prompts: {}", e)],
                ),
            });

            report.checks.push(match roster.validate_models(registry) {
                Ok(()) => CheckResult::pass("Model availability check", "All assigned models are available"),
                Err(e) => CheckResult::fail("Model availability check", vec![format!("Model validation failed: {}", e)]),
            });
            report.checks.push(check_api_keys(roster, registry, &lookup));
        }
        Err(_) => {
            for name in [
                "Role assignment validation",
                "Model availability check",
                "Environment configuration check",
            ] {
                report
                    .checks
                    .push(CheckResult::fail(name, vec!["Skipped: model mapping not loaded".to_string()]));
            }
        }
    }

    report.checks.push(check_output_dir(output_dir));
    report
}
