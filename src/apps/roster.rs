//! Participant roster
//!
//! Parses an app's `player_models.csv`:
//!
//! ```text
//! player_id,model_name,role
//! 1,human,
//! 2,gemini-1.5-flash,P5
//! ```
//!
//! The `role` column is optional. A model name of `human` marks a human
//! participant.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config::ModelRegistry;

/// Model name reserved for human participants
pub const HUMAN: &str = "human";

/// Roster errors
#[derive(Error, Debug)]
pub enum RosterError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("No participant assignments found")]
    Empty,

    #[error("Player {0} is listed more than once")]
    DuplicatePlayer(u32),

    #[error("Player ids must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("Player {player_id} is assigned model '{model}' which is not available in botex.env")]
    UnknownModel { player_id: u32, model: String },
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    player_id: u32,
    model_name: String,
    #[serde(default)]
    role: Option<String>,
}

/// One participant slot in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// 1-based position, equal to the oTree `id_in_session`
    pub player_id: u32,
    pub model_name: String,
    pub role: Option<String>,
}

impl Assignment {
    pub fn is_human(&self) -> bool {
        self.model_name.eq_ignore_ascii_case(HUMAN)
    }

    /// Role label, `default` when none is assigned
    pub fn role_or_default(&self) -> &str {
        self.role.as_deref().unwrap_or("default")
    }
}

/// Validated list of assignments sorted by player id
#[derive(Debug, Clone)]
pub struct Roster {
    assignments: Vec<Assignment>,
}

impl Roster {
    /// Load a roster from a CSV file
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let file = File::open(path).map_err(|source| RosterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let roster = Self::from_reader(file)?;
        info!(
            "Loaded {} participant assignments from {}",
            roster.len(),
            path.display()
        );
        Ok(roster)
    }

    /// Parse a roster from any CSV source
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RosterError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut assignments = Vec::new();
        for row in rdr.deserialize::<RosterRow>() {
            let row = row?;
            assignments.push(Assignment {
                player_id: row.player_id,
                model_name: row.model_name,
                role: row.role.filter(|r| !r.is_empty()),
            });
        }

        Self::from_assignments(assignments)
    }

    /// Validate and sort a list of assignments
    pub fn from_assignments(mut assignments: Vec<Assignment>) -> Result<Self, RosterError> {
        if assignments.is_empty() {
            return Err(RosterError::Empty);
        }

        assignments.sort_by_key(|a| a.player_id);

        for pair in assignments.windows(2) {
            if pair[0].player_id == pair[1].player_id {
                return Err(RosterError::DuplicatePlayer(pair[0].player_id));
            }
        }

        for (idx, assignment) in assignments.iter().enumerate() {
            let expected = idx as u32 + 1;
            if assignment.player_id != expected {
                return Err(RosterError::NonContiguous {
                    expected,
                    found: assignment.player_id,
                });
            }
        }

        Ok(Self { assignments })
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn get(&self, player_id: u32) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.player_id == player_id)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Human flags in player order
    pub fn is_human_flags(&self) -> Vec<bool> {
        self.assignments.iter().map(Assignment::is_human).collect()
    }

    pub fn human_count(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_human()).count()
    }

    pub fn bot_count(&self) -> usize {
        self.len() - self.human_count()
    }

    /// Assigned roles by player id
    pub fn roles(&self) -> BTreeMap<u32, String> {
        self.assignments
            .iter()
            .filter_map(|a| a.role.clone().map(|r| (a.player_id, r)))
            .collect()
    }

    pub fn has_roles(&self) -> bool {
        self.assignments.iter().any(|a| a.role.is_some())
    }

    /// Distinct non-human model names, sorted
    pub fn unique_models(&self) -> BTreeSet<&str> {
        self.assignments
            .iter()
            .filter(|a| !a.is_human())
            .map(|a| a.model_name.as_str())
            .collect()
    }

    /// Check every bot model is declared in the registry
    pub fn validate_models(&self, registry: &ModelRegistry) -> Result<(), RosterError> {
        for assignment in self.assignments.iter().filter(|a| !a.is_human()) {
            if !registry.contains(&assignment.model_name) {
                return Err(RosterError::UnknownModel {
                    player_id: assignment.player_id,
                    model: assignment.model_name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(csv: &str) -> Result<Roster, RosterError> {
        Roster::from_reader(csv.as_bytes())
    }

    #[test]
    fn test_parse_with_roles() {
        let roster = parse("player_id,model_name,role\n2,gemini-1.5-flash,P5\n1, Human ,\n").unwrap();

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.is_human_flags(), vec![true, false]);
        assert_eq!(roster.human_count(), 1);
        assert_eq!(roster.bot_count(), 1);
        assert_eq!(roster.get(1).unwrap().role, None);
        assert_eq!(roster.roles().get(&2).map(String::as_str), Some("P5"));
        assert!(roster.has_roles());
    }

    #[test]
    fn test_missing_role_column_uses_default() {
        let roster = parse("player_id,model_name\n1,gemini-1.5-flash\n2,gemini-1.5-flash\n").unwrap();

        assert!(!roster.has_roles());
        assert!(roster.roles().is_empty());
        for a in roster.assignments() {
            assert_eq!(a.role_or_default(), "default");
        }
        assert_eq!(roster.unique_models().len(), 1);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let roster = parse("player_id,model_name,role\n1,human,\n2,not-a-model,P2\n").unwrap();
        let registry = ModelRegistry::from_lookup(|_| None);

        let err = roster.validate_models(&registry).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Player 2 is assigned model 'not-a-model' which is not available in botex.env"
        );
    }

    #[test]
    fn test_known_model_accepted() {
        let roster = parse("player_id,model_name\n1,gemini-1.5-flash\n").unwrap();
        let registry = ModelRegistry::from_lookup(|_| None);
        assert!(roster.validate_models(&registry).is_ok());
    }

    #[test]
    fn test_invalid_rosters() {
        assert!(matches!(parse("player_id,model_name\n"), Err(RosterError::Empty)));
        assert!(matches!(
            parse("player_id,model_name\n1,human\n1,human\n"),
            Err(RosterError::DuplicatePlayer(1))
        ));
        assert!(matches!(
            parse("player_id,model_name\n1,human\n3,human\n"),
            Err(RosterError::NonContiguous { expected: 2, found: 3 })
        ));
        assert!(matches!(
            parse("player_id,model_name\nx,human\n"),
            Err(RosterError::Csv(_))
        ));
    }
}
