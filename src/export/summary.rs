//! Plain text summary written at the end of every session

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use super::{ExportError, SessionFiles};
use crate::apps::Roster;
use crate::game::{Choice, ChoiceTally};
use crate::parser::responses::ResponseRow;

const RULE: usize = 70;
const SECTION_RULE: usize = 20;

/// Format a byte count with thousands separators
pub fn format_bytes(bytes: u64) -> String {
    let digits = bytes.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Count the choice answers of the bots
pub fn tally_choices(rows: &[ResponseRow]) -> ChoiceTally {
    let mut tally = ChoiceTally::new();
    for row in rows {
        if row.question_id.to_lowercase().contains("choice") {
            tally.record(&row.answer);
        }
    }
    tally
}

/// A role line of the summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleLine {
    pub player_id: u32,
    pub role: String,
    pub is_human: bool,
    pub model: String,
}

/// What the summary reports about a session
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub app: String,
    pub session_id: String,
    pub total: usize,
    pub humans: usize,
    pub bots: usize,
    pub roles: Vec<RoleLine>,
    pub tally: ChoiceTally,
}

impl ExportSummary {
    pub fn from_roster(app: &str, session_id: &str, roster: &Roster, tally: ChoiceTally) -> Self {
        let roles = roster
            .assignments()
            .iter()
            .filter_map(|a| {
                a.role.as_ref().map(|role| RoleLine {
                    player_id: a.player_id,
                    role: role.clone(),
                    is_human: a.is_human(),
                    model: a.model_name.clone(),
                })
            })
            .collect();

        Self {
            app: app.to_string(),
            session_id: session_id.to_string(),
            total: roster.len(),
            humans: roster.human_count(),
            bots: roster.bot_count(),
            roles,
            tally,
        }
    }

    /// Render the summary, listing the CSV files found in `dir`
    pub fn render(&self, dir: &Path, timestamp: &str) -> Result<String, ExportError> {
        let mut files: Vec<(String, u64)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".csv") {
                files.push((name, entry.metadata()?.len()));
            }
        }
        files.sort();

        let mut out = String::new();
        let _ = writeln!(out, "Data Export Summary - {}", timestamp);
        let _ = writeln!(out, "{}\n", "=".repeat(RULE));

        let _ = writeln!(out, "FILES EXPORTED:");
        let _ = writeln!(out, "{}", "-".repeat(SECTION_RULE));
        for (name, size) in &files {
            let _ = writeln!(out, "  {} ({} bytes)", name, format_bytes(*size));
        }

        let _ = writeln!(out, "\nEXPERIMENT DETAILS:");
        let _ = writeln!(out, "{}", "-".repeat(SECTION_RULE));
        let _ = writeln!(out, "App: {}", self.app);
        let _ = writeln!(out, "Session ID: {}", self.session_id);
        let _ = writeln!(out, "Total Participants: {}", self.total);
        let _ = writeln!(out, "Human Participants: {}", self.humans);
        let _ = writeln!(out, "Bot Participants: {}", self.bots);

        if !self.roles.is_empty() {
            let _ = writeln!(out, "\nROLE ASSIGNMENTS:");
            let _ = writeln!(out, "{}", "-".repeat(SECTION_RULE));
            for line in &self.roles {
                let kind = if line.is_human { "HUMAN" } else { "BOT" };
                let model = if line.is_human {
                    String::new()
                } else {
                    format!(" ({})", line.model)
                };
                let _ = writeln!(out, "  Player {}: {} ({}){}", line.player_id, line.role, kind, model);
            }
        }

        if !self.tally.is_empty() {
            let _ = writeln!(out, "\nBOT CHOICES:");
            let _ = writeln!(out, "{}", "-".repeat(SECTION_RULE));
            for choice in Choice::all() {
                let _ = writeln!(out, "  {}: {}", choice.display_name(), self.tally.count(choice));
            }
            if self.tally.unparsed() > 0 {
                let _ = writeln!(out, "  Unparsed: {}", self.tally.unparsed());
            }
        }

        Ok(out)
    }

    /// Write the summary file of a session
    pub fn write(&self, files: &SessionFiles) -> Result<PathBuf, ExportError> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let text = self.render(files.dir(), &timestamp)?;
        let path = files.summary_txt();
        fs::write(&path, text)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::Roster;

    fn roster() -> Roster {
        Roster::from_reader("player_id,model_name,role\n1,human,P1\n2,gemini-1.5-flash,P2r\n".as_bytes())
            .unwrap()
    }

    fn row(question_id: &str, answer: &str) -> ResponseRow {
        ResponseRow {
            session_id: "sess01".to_string(),
            participant_id: "p2".to_string(),
            round: 1,
            question_id: question_id.to_string(),
            answer: answer.to_string(),
            reason: String::new(),
            summary: String::new(),
            prompt: String::new(),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0");
        assert_eq!(format_bytes(999), "999");
        assert_eq!(format_bytes(1000), "1,000");
        assert_eq!(format_bytes(1234567), "1,234,567");
    }

    #[test]
    fn test_tally_choices_only_counts_choice_questions() {
        let rows = vec![
            row("choice", "R"),
            row("choice", "Paper"),
            row("confidence", "80"),
            row("choice_2", "maybe"),
        ];
        let tally = tally_choices(&rows);

        assert_eq!(tally.count(Choice::Rock), 1);
        assert_eq!(tally.count(Choice::Paper), 1);
        assert_eq!(tally.unparsed(), 1);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    fn test_render_summary() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), vec![b'x'; 1500]).unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("log.sqlite3"), "x").unwrap();

        let summary = ExportSummary::from_roster("rps_oneshot", "sess01", &roster(), tally_choices(&[row("choice", "S")]));
        let text = summary.render(dir.path(), "2026-01-01 12:00:00").unwrap();

        assert!(text.starts_with("Data Export Summary - 2026-01-01 12:00:00\n"));
        let a = text.find("  a.csv (1 bytes)").unwrap();
        let b = text.find("  b.csv (1,500 bytes)").unwrap();
        assert!(a < b);
        assert!(!text.contains("sqlite3"));
        assert!(text.contains("App: rps_oneshot\n"));
        assert!(text.contains("Human Participants: 1\n"));
        assert!(text.contains("  Player 1: P1 (HUMAN)\n"));
        assert!(text.contains("  Player 2: P2r (BOT) (gemini-1.5-flash)\n"));
        assert!(text.contains("  Scissors: 1\n"));
    }

    #[test]
    fn test_summary_without_roles() {
        let dir = tempfile::tempdir().unwrap();
        let roster = Roster::from_reader("player_id,model_name\n1,gemini-1.5-flash\n".as_bytes()).unwrap();

        let summary = ExportSummary::from_roster("rps", "sess01", &roster, ChoiceTally::new());
        let text = summary.render(dir.path(), "now").unwrap();

        assert!(!text.contains("ROLE ASSIGNMENTS"));
        assert!(!text.contains("BOT CHOICES"));
        assert!(text.contains("Bot Participants: 1\n"));
    }

    #[test]
    fn test_write_summary() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), "sess01", "_rps");

        let summary = ExportSummary::from_roster("rps", "sess01", &roster(), ChoiceTally::new());
        let path = summary.write(&files).unwrap();

        assert!(path.ends_with("data_export_summary_sess01_rps.txt"));
        assert!(fs::read_to_string(path).unwrap().contains("Session ID: sess01"));
    }
}
