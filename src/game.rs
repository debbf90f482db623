//! Rock-Paper-Scissors rules
//!
//! The experiment host settles games itself; these rules are used to read
//! bot answers and to tally choices in the run summary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Choice {
    #[serde(rename = "R")]
    Rock,
    #[serde(rename = "P")]
    Paper,
    #[serde(rename = "S")]
    Scissors,
}

impl Choice {
    pub fn all() -> Vec<Choice> {
        vec![Choice::Rock, Choice::Paper, Choice::Scissors]
    }

    /// Single-letter code stored by the experiment
    pub fn letter(&self) -> &'static str {
        match self {
            Choice::Rock => "R",
            Choice::Paper => "P",
            Choice::Scissors => "S",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Choice::Rock => "Rock",
            Choice::Paper => "Paper",
            Choice::Scissors => "Scissors",
        }
    }

    /// Whether `self` wins against `other`
    pub fn beats(&self, other: Choice) -> bool {
        matches!(
            (self, other),
            (Choice::Rock, Choice::Scissors)
                | (Choice::Paper, Choice::Rock)
                | (Choice::Scissors, Choice::Paper)
        )
    }

    pub fn against(&self, other: Choice) -> Outcome {
        if *self == other {
            Outcome::Tie
        } else if self.beats(other) {
            Outcome::Win
        } else {
            Outcome::Lose
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Choice {
    type Err = String;

    /// Accepts letters and names in any case, ignoring surrounding quotes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().trim_matches(|c| c == '\'' || c == '"').to_lowercase();
        match cleaned.as_str() {
            "r" | "rock" => Ok(Choice::Rock),
            "p" | "paper" => Ok(Choice::Paper),
            "s" | "scissors" => Ok(Choice::Scissors),
            _ => Err(format!("Unknown choice: {}", s)),
        }
    }
}

/// Result of a game from one player's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Lose,
    Tie,
}

/// Points awarded per outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoffTable {
    pub win: u32,
    pub lose: u32,
    pub tie: u32,
}

impl PayoffTable {
    /// Single game against a random opponent
    pub const ONE_SHOT: PayoffTable = PayoffTable { win: 1, lose: 0, tie: 0 };
    /// Multi-round game between two players
    pub const REPEATED: PayoffTable = PayoffTable { win: 3, lose: 0, tie: 1 };

    pub fn payoff(&self, outcome: Outcome) -> u32 {
        match outcome {
            Outcome::Win => self.win,
            Outcome::Lose => self.lose,
            Outcome::Tie => self.tie,
        }
    }

    /// Payoffs of both players
    pub fn settle(&self, a: Choice, b: Choice) -> (u32, u32) {
        (self.payoff(a.against(b)), self.payoff(b.against(a)))
    }
}

/// Counts of parsed choices
#[derive(Debug, Clone, Default)]
pub struct ChoiceTally {
    counts: BTreeMap<Choice, usize>,
    unparsed: usize,
}

impl ChoiceTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw answer
    pub fn record(&mut self, answer: &str) {
        match answer.parse::<Choice>() {
            Ok(choice) => *self.counts.entry(choice).or_insert(0) += 1,
            Err(_) => self.unparsed += 1,
        }
    }

    pub fn count(&self, choice: Choice) -> usize {
        self.counts.get(&choice).copied().unwrap_or(0)
    }

    pub fn unparsed(&self) -> usize {
        self.unparsed
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum::<usize>() + self.unparsed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!("R".parse::<Choice>().unwrap(), Choice::Rock);
        assert_eq!(" paper ".parse::<Choice>().unwrap(), Choice::Paper);
        assert_eq!("'S'".parse::<Choice>().unwrap(), Choice::Scissors);
        assert!("lizard".parse::<Choice>().is_err());
    }

    #[test]
    fn test_beats_is_cyclic() {
        for a in Choice::all() {
            assert!(!a.beats(a));
            let winners = Choice::all().into_iter().filter(|b| a.beats(*b)).count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_settle() {
        assert_eq!(PayoffTable::REPEATED.settle(Choice::Rock, Choice::Scissors), (3, 0));
        assert_eq!(PayoffTable::REPEATED.settle(Choice::Rock, Choice::Rock), (1, 1));
        assert_eq!(PayoffTable::ONE_SHOT.settle(Choice::Rock, Choice::Paper), (0, 1));
        assert_eq!(PayoffTable::ONE_SHOT.settle(Choice::Paper, Choice::Paper), (0, 0));
    }

    #[test]
    fn test_tally() {
        let mut tally = ChoiceTally::new();
        for answer in ["R", "rock", "P", "?"] {
            tally.record(answer);
        }
        assert_eq!(tally.count(Choice::Rock), 2);
        assert_eq!(tally.count(Choice::Scissors), 0);
        assert_eq!(tally.unparsed(), 1);
        assert_eq!(tally.total(), 4);
    }
}
