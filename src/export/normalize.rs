//! Wide CSV normalization
//!
//! oTree's wide export has one row per participant and one column per
//! field, prefixed by the level it belongs to:
//!
//! - `session.<field>` and `participant.<field>`
//! - `<app>.<round>.player.<field>`, `<app>.<round>.group.<field>` and
//!   `<app>.<round>.subsession.<field>`
//!
//! `normalize_wide` splits those columns into one table per level.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;

use csv::StringRecord;
use tracing::{debug, info};

use super::csv_export::write_rows;
use super::{ExportError, SessionFiles, Table};

const GROUP_ID: &str = "id_in_subsession";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Level {
    Player,
    Group,
}

/// Where a wide column belongs
#[derive(Debug, Clone, PartialEq, Eq)]
enum Column {
    Session(String),
    Participant(String),
    Round {
        app: String,
        round: u32,
        level: Level,
        field: String,
    },
    Ignored,
}

fn classify(header: &str) -> Column {
    let parts: Vec<&str> = header.split('.').collect();
    match parts.as_slice() {
        ["session", rest @ ..] if !rest.is_empty() => Column::Session(rest.join(".")),
        ["participant", rest @ ..] if !rest.is_empty() => Column::Participant(rest.join(".")),
        [app, round, level, rest @ ..] if !rest.is_empty() => {
            let Ok(round) = round.parse::<u32>() else {
                return Column::Ignored;
            };
            let level = match *level {
                "player" => Level::Player,
                "group" => Level::Group,
                _ => return Column::Ignored,
            };
            Column::Round {
                app: app.to_string(),
                round,
                level,
                field: rest.join("."),
            }
        }
        _ => Column::Ignored,
    }
}

/// One normalized table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl NormalizedTable {
    fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Value of `column` in `row`
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The four tables of a wide export
#[derive(Debug, Clone, Default)]
pub struct NormalizedData {
    pub session: NormalizedTable,
    pub participant: NormalizedTable,
    pub group: NormalizedTable,
    pub player: NormalizedTable,
}

impl NormalizedData {
    pub fn table(&self, table: Table) -> &NormalizedTable {
        match table {
            Table::Session => &self.session,
            Table::Participant => &self.participant,
            Table::Group => &self.group,
            Table::Player => &self.player,
        }
    }
}

fn push_unique(fields: &mut Vec<String>, field: &str) {
    if !fields.iter().any(|f| f == field) {
        fields.push(field.to_string());
    }
}

/// Column layout of a wide export
struct Layout {
    session: Vec<(String, usize)>,
    participant: Vec<(String, usize)>,
    /// (app, round) pairs in column order
    slots: Vec<(String, u32)>,
    player_fields: Vec<String>,
    group_fields: Vec<String>,
    round_columns: HashMap<(String, u32, Level, String), usize>,
}

impl Layout {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut layout = Layout {
            session: Vec::new(),
            participant: Vec::new(),
            slots: Vec::new(),
            player_fields: Vec::new(),
            group_fields: Vec::new(),
            round_columns: HashMap::new(),
        };

        for (idx, header) in headers.iter().enumerate() {
            match classify(header) {
                Column::Session(field) => layout.session.push((field, idx)),
                Column::Participant(field) => layout.participant.push((field, idx)),
                Column::Round {
                    app,
                    round,
                    level,
                    field,
                } => {
                    let slot = (app.clone(), round);
                    if !layout.slots.contains(&slot) {
                        layout.slots.push(slot);
                    }
                    match level {
                        Level::Player => push_unique(&mut layout.player_fields, &field),
                        Level::Group if field != GROUP_ID => {
                            push_unique(&mut layout.group_fields, &field)
                        }
                        Level::Group => {}
                    }
                    layout.round_columns.insert((app, round, level, field), idx);
                }
                Column::Ignored => debug!("Ignoring wide column {}", header),
            }
        }

        layout
    }

    fn session_column(&self, field: &str) -> Option<usize> {
        self.session.iter().find(|(f, _)| f == field).map(|(_, idx)| *idx)
    }

    fn participant_column(&self, field: &str) -> Option<usize> {
        self.participant.iter().find(|(f, _)| f == field).map(|(_, idx)| *idx)
    }

    fn round_value<'r>(
        &self,
        record: &'r StringRecord,
        slot: &(String, u32),
        level: Level,
        field: &str,
    ) -> &'r str {
        self.round_columns
            .get(&(slot.0.clone(), slot.1, level, field.to_string()))
            .and_then(|idx| record.get(*idx))
            .unwrap_or("")
    }
}

fn cell(record: &StringRecord, idx: Option<usize>) -> String {
    idx.and_then(|i| record.get(i)).unwrap_or("").to_string()
}

fn with_keys(keys: &[&str], fields: impl IntoIterator<Item = String>) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).chain(fields).collect()
}

/// Split a wide export, keeping only rows of `session_code` when given
pub fn normalize_wide<R: Read>(reader: R, session_code: Option<&str>) -> Result<NormalizedData, ExportError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers()?.clone();
    let layout = Layout::from_headers(&headers);

    let session_code_idx = layout.session_column("code");
    let participant_code_idx = layout.participant_column("code");
    let session_fields: Vec<String> = layout
        .session
        .iter()
        .filter(|(f, _)| f != "code")
        .map(|(f, _)| f.clone())
        .collect();

    let mut data = NormalizedData {
        session: NormalizedTable::new(with_keys(&["code"], session_fields.clone())),
        participant: NormalizedTable::new(with_keys(
            &["session_code"],
            layout.participant.iter().map(|(f, _)| f.clone()),
        )),
        group: NormalizedTable::new(with_keys(
            &["session_code", "app", "round", GROUP_ID],
            layout.group_fields.clone(),
        )),
        player: NormalizedTable::new(with_keys(
            &["session_code", "participant_code", "app", "round", "group_id"],
            layout.player_fields.clone(),
        )),
    };

    let mut seen_sessions = HashSet::new();
    let mut seen_groups = HashSet::new();

    for record in reader.records() {
        let record = record?;
        let session = cell(&record, session_code_idx);
        if let Some(code) = session_code {
            if session_code_idx.is_some() && session != code {
                continue;
            }
        }

        if seen_sessions.insert(session.clone()) && session_code_idx.is_some() {
            let mut row = vec![session.clone()];
            row.extend(
                session_fields
                    .iter()
                    .map(|f| cell(&record, layout.session_column(f))),
            );
            data.session.rows.push(row);
        }

        let mut participant_row = vec![session.clone()];
        participant_row.extend(
            layout
                .participant
                .iter()
                .map(|(_, idx)| cell(&record, Some(*idx))),
        );
        data.participant.rows.push(participant_row);

        let participant = cell(&record, participant_code_idx);
        for slot in &layout.slots {
            let values: Vec<String> = layout
                .player_fields
                .iter()
                .map(|f| layout.round_value(&record, slot, Level::Player, f).to_string())
                .collect();
            let group_id = layout.round_value(&record, slot, Level::Group, GROUP_ID).to_string();

            // Apps the participant never reached leave every cell blank
            if values.iter().all(String::is_empty) && group_id.is_empty() {
                continue;
            }

            let mut player_row = vec![
                session.clone(),
                participant.clone(),
                slot.0.clone(),
                slot.1.to_string(),
                group_id.clone(),
            ];
            player_row.extend(values);
            data.player.rows.push(player_row);

            if !group_id.is_empty()
                && seen_groups.insert((session.clone(), slot.clone(), group_id.clone()))
            {
                let mut group_row = vec![
                    session.clone(),
                    slot.0.clone(),
                    slot.1.to_string(),
                    group_id,
                ];
                group_row.extend(
                    layout
                        .group_fields
                        .iter()
                        .map(|f| layout.round_value(&record, slot, Level::Group, f).to_string()),
                );
                data.group.rows.push(group_row);
            }
        }
    }

    Ok(data)
}

/// Normalize the session's wide CSV and write the four table files
pub fn normalize_file(files: &SessionFiles) -> Result<NormalizedData, ExportError> {
    let wide = files.wide_csv();
    let file = File::open(&wide)?;
    if file.metadata()?.len() == 0 {
        return Err(ExportError::EmptyWideCsv(wide));
    }

    let data = normalize_wide(file, Some(files.session_id()))?;
    for table in Table::all() {
        let normalized = data.table(table);
        let path = files.table_csv(table);
        write_rows(&normalized.headers, &normalized.rows, &path)?;
        info!("Created {} data: {} ({} rows)", table.as_str(), path.display(), normalized.len());
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const WIDE: &str = "\
participant.id_in_session,participant.code,participant.payoff,session.code,session.config.name,rps.1.player.id_in_group,rps.1.player.choice,rps.1.group.id_in_subsession,rps.1.subsession.round_number,rps.2.player.id_in_group,rps.2.player.choice,rps.2.group.id_in_subsession
1,p1,3,sess01,rps,1,R,1,1,1,P,1
2,p2,1,sess01,rps,2,S,1,1,2,P,1
1,q1,0,other,rps,1,,,,,,
";

    #[test]
    fn test_classify_columns() {
        assert_eq!(classify("session.config.name"), Column::Session("config.name".to_string()));
        assert_eq!(classify("participant.code"), Column::Participant("code".to_string()));
        assert_eq!(
            classify("rps.3.player.choice"),
            Column::Round {
                app: "rps".to_string(),
                round: 3,
                level: Level::Player,
                field: "choice".to_string(),
            }
        );
        assert_eq!(classify("rps.1.subsession.round_number"), Column::Ignored);
        assert_eq!(classify("rps.x.player.choice"), Column::Ignored);
    }

    #[test]
    fn test_normalize_splits_levels() {
        let data = normalize_wide(WIDE.as_bytes(), Some("sess01")).unwrap();

        assert_eq!(data.session.len(), 1);
        assert_eq!(data.session.value(0, "config.name"), Some("rps"));

        assert_eq!(data.participant.len(), 2);
        assert_eq!(data.participant.value(1, "code"), Some("p2"));
        assert_eq!(data.participant.value(1, "session_code"), Some("sess01"));

        // two participants over two rounds
        assert_eq!(data.player.len(), 4);
        assert_eq!(data.player.value(0, "participant_code"), Some("p1"));
        assert_eq!(data.player.value(0, "round"), Some("1"));
        assert_eq!(data.player.value(3, "choice"), Some("P"));
        assert_eq!(data.player.value(3, "group_id"), Some("1"));

        // one group per round
        assert_eq!(data.group.len(), 2);
        assert_eq!(data.group.value(1, "round"), Some("2"));
    }

    #[test]
    fn test_normalize_without_filter_keeps_all_sessions() {
        let data = normalize_wide(WIDE.as_bytes(), None).unwrap();

        assert_eq!(data.session.len(), 2);
        assert_eq!(data.participant.len(), 3);
        // the third participant only has an id_in_group in round 1
        assert_eq!(data.player.len(), 5);
    }

    #[test]
    fn test_normalize_file_writes_tables() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), "sess01", "_rps");
        fs::write(files.wide_csv(), WIDE).unwrap();

        normalize_file(&files).unwrap();

        for table in Table::all() {
            assert!(files.table_csv(table).exists(), "{} missing", table.as_str());
        }
        let player = fs::read_to_string(files.table_csv(Table::Player)).unwrap();
        assert!(player.starts_with("session_code,participant_code,app,round,group_id,id_in_group,choice"));
    }

    #[test]
    fn test_empty_wide_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), "sess01", "");
        fs::write(files.wide_csv(), "").unwrap();

        assert!(matches!(normalize_file(&files), Err(ExportError::EmptyWideCsv(_))));
    }
}
